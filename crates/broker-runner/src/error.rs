//! Runner error types.

use thiserror::Error;
use uuid::Uuid;

/// Result type for runner and sandbox operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors from the cluster automation collaborators.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The automation run started but did not succeed. `handle` names the
    /// run so its sandbox can still be torn down.
    #[error("automation run {handle} failed: {message}")]
    RunFailed { handle: String, message: String },

    #[error("service instance {0} has no spec")]
    MissingSpec(Uuid),

    #[error("automation run not found: {0}")]
    RunNotFound(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RunnerError {
    /// Workload handle known at the time of failure, empty if none.
    pub fn handle(&self) -> &str {
        match self {
            RunnerError::RunFailed { handle, .. } => handle,
            _ => "",
        }
    }
}
