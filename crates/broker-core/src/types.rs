//! Domain types shared across the broker crates.
//!
//! Every type here is persisted as JSON by `broker-state`, so field names
//! are part of the on-disk format.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open, string-keyed parameter bag. Values are arbitrary JSON and are only
/// shape-checked at the point of use.
pub type Parameters = Map<String, Value>;

/// Parameter key carrying the selected plan into the automation run.
pub const PLAN_PARAMETER_KEY: &str = "_apb_plan_id";

/// Parameter key carrying provision-time credentials into bind/unbind runs.
pub const PROVISION_CREDENTIALS_KEY: &str = "_apb_provision_creds";

/// Parameter key carrying bind-time credentials into unbind runs.
pub const BIND_CREDENTIALS_KEY: &str = "_apb_bind_creds";

/// Describes one user-facing parameter of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxlength: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

/// A named variant of a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Derived from the owning spec's name, see [`crate::identity`].
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
}

/// How a spec's automation may be driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncSupport {
    #[default]
    Optional,
    Required,
    Unsupported,
}

/// A catalog entry: one provisionable service and its automation image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "name", default)]
    pub fq_name: String,
    pub image: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(rename = "async", default)]
    pub async_support: AsyncSupport,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl Spec {
    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.name == name)
    }
}

/// Request context the instance was created in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub namespace: String,
}

/// A provisioned (or provisioning) service instance.
///
/// `spec` and `parameters` are optional only so that a half-written record
/// can still be loaded and cleaned up by recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    #[serde(default)]
    pub spec: Option<Spec>,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    #[serde(default)]
    pub binding_ids: BTreeSet<Uuid>,
}

impl ServiceInstance {
    pub fn new(id: Uuid, spec: Spec, context: Context, parameters: Parameters) -> Self {
        Self {
            id,
            spec: Some(spec),
            context,
            parameters: Some(parameters),
            binding_ids: BTreeSet::new(),
        }
    }

    pub fn add_binding(&mut self, binding_id: Uuid) {
        self.binding_ids.insert(binding_id);
    }

    pub fn remove_binding(&mut self, binding_id: &Uuid) {
        self.binding_ids.remove(binding_id);
    }

    pub fn has_bindings(&self) -> bool {
        !self.binding_ids.is_empty()
    }

    /// True when the record is missing data a job needs to run.
    pub fn is_incomplete(&self) -> bool {
        self.spec.is_none() || self.parameters.is_none()
    }

    pub fn spec_id(&self) -> &str {
        self.spec.as_ref().map(|s| s.id.as_str()).unwrap_or_default()
    }
}

/// A binding against a service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindInstance {
    pub id: Uuid,
    pub service_id: Uuid,
    #[serde(default)]
    pub parameters: Option<Parameters>,
}

/// Opaque connection values produced by a provision or bind run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCredentials {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub credentials: Map<String, Value>,
}

impl ExtractedCredentials {
    pub fn new(credentials: Map<String, Value>) -> Self {
        Self { credentials }
    }
}

/// Lifecycle of an asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        !matches!(self, State::InProgress)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            State::InProgress => "in progress",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
        })
    }
}

/// Which action a job performs. Records written before the field existed
/// decode as provision jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMethod {
    #[default]
    Provision,
    Deprovision,
}

/// Persisted progress of one job against one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub token: String,
    pub state: State,
    /// Workload handle of the automation run, empty until known.
    #[serde(default)]
    pub podname: String,
    #[serde(default)]
    pub method: JobMethod,
}

impl JobState {
    pub fn new(token: impl Into<String>, state: State) -> Self {
        Self {
            token: token.into(),
            state,
            podname: String::new(),
            method: JobMethod::Provision,
        }
    }

    pub fn with_method(mut self, method: JobMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_podname(mut self, podname: impl Into<String>) -> Self {
        self.podname = podname.into();
        self
    }
}

/// A job state found during a scan, paired with its owning instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverStatus {
    pub instance_id: Uuid,
    pub state: JobState,
}

/// Cluster connection settings handed to every automation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub host: String,
    pub ca_file: String,
    pub bearer_token_file: String,
    pub image_pull_policy: String,
    /// Namespace used when a request carries none.
    pub namespace: String,
}
