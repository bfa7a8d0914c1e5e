//! Request and response types of the broker operations.

use serde::{Deserialize, Serialize};

use broker_core::{Context, Parameters, State};

use crate::catalog::Service;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// Provisioned synchronously.
    Created,
    /// Running in the background; poll with `operation`.
    InProgress { operation: String },
    /// The same request was already served.
    AlreadyProvisioned,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    #[serde(default)]
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeprovisionOutcome {
    Removed,
    InProgress { operation: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BindOutcome {
    Created { credentials: Parameters },
    AlreadyBound,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnbindRequest {
    #[serde(default)]
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastOperationRequest {
    /// Job token returned when the operation was accepted.
    pub operation: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

/// Status of an operation as reported to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl From<State> for LastOperationState {
    fn from(state: State) -> Self {
        match state {
            State::InProgress => LastOperationState::InProgress,
            State::Succeeded => LastOperationState::Succeeded,
            State::Failed => LastOperationState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl LastOperationResponse {
    pub fn from_state(state: State) -> Self {
        Self {
            state: state.into(),
            description: String::new(),
        }
    }

    pub fn failed() -> Self {
        Self {
            state: LastOperationState::Failed,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub spec_count: usize,
    pub image_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}
