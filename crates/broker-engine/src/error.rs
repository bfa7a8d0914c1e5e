//! Broker error types.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use broker_core::SpecError;
use broker_runner::RunnerError;
use broker_state::StateError;

use crate::requests::LastOperationResponse;

/// Errors raised by the work engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no subscriber attached to topic: {0}")]
    NoSubscriber(String),

    #[error("a subscriber is already attached to topic: {0}")]
    SubscriberExists(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while loading specs from a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry {name}: spec directory {} does not exist", path.display())]
    MissingDirectory { name: String, path: PathBuf },

    #[error("registry {name}: {source}")]
    Walk {
        name: String,
        #[source]
        source: walkdir::Error,
    },

    #[error("registry {name}: failed to read {}: {source}", path.display())]
    Read {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry {name}: scan task failed: {source}")]
    Task {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance {0} already exists with different parameters")]
    Duplicate(Uuid),

    #[error("instance {0} still has bindings")]
    BindingExists(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("spec {0} requires asynchronous operations")]
    AsyncRequired(String),

    #[error("no credentials available for instance {0}")]
    NoCredentials(Uuid),

    #[error("all registries failed to load")]
    AllRegistriesFailed,

    #[error("dev broker operations are disabled")]
    DevBrokerDisabled,

    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("malformed work message: {0}")]
    MalformedMessage(String),

    /// The job state could not be read. `response` is the failed status a
    /// caller should still report.
    #[error("could not read job state: {source}")]
    OperationLookup {
        response: LastOperationResponse,
        #[source]
        source: StateError,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Map a store miss to [`BrokerError::NotFound`], passing other errors through.
pub(crate) fn not_found(err: StateError, what: impl FnOnce() -> String) -> BrokerError {
    if err.is_not_found() {
        BrokerError::NotFound(what())
    } else {
        BrokerError::State(err)
    }
}
