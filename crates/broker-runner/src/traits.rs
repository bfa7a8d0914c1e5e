//! Runner and sandbox trait definitions.
//!
//! The broker never talks to the cluster directly. Every automation action
//! goes through a [`Runner`], and every run executes under a disposable
//! identity managed by a [`SandboxManager`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use broker_core::{ClusterConfig, ExtractedCredentials, Parameters, ServiceInstance};

use crate::error::RunnerResult;

/// Outcome of a successful provision or bind run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Workload handle of the run.
    pub handle: String,
    pub credentials: Option<ExtractedCredentials>,
}

/// Executes automation actions for a service instance against the cluster.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn provision(
        &self,
        instance: &ServiceInstance,
        cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput>;

    /// Returns the workload handle of the run.
    async fn deprovision(
        &self,
        instance: &ServiceInstance,
        cluster: &ClusterConfig,
    ) -> RunnerResult<String>;

    async fn bind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput>;

    async fn unbind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        cluster: &ClusterConfig,
    ) -> RunnerResult<()>;

    /// Query a previously started run.
    ///
    /// `Ok(Some)` when the run finished and left credentials, `Ok(None)` when
    /// it has not finished (or finished without credentials), `Err` when the
    /// run cannot be queried.
    async fn extract_credentials(
        &self,
        handle: &str,
        namespace: &str,
    ) -> RunnerResult<Option<ExtractedCredentials>>;
}

/// Creates and destroys the scoped execution identity of a run.
#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Create a sandbox named `id` in `namespace` and return its handle.
    async fn create(&self, namespace: &str, id: &str) -> RunnerResult<String>;

    /// Destroy a sandbox. An empty handle is a no-op.
    async fn destroy(&self, handle: &str, namespace: &str) -> RunnerResult<()>;
}

/// Process-wide cluster collaborators, built once at startup and shared by
/// the broker and its jobs.
#[derive(Clone)]
pub struct Cluster {
    pub runner: Arc<dyn Runner>,
    pub sandbox: Arc<dyn SandboxManager>,
    pub config: ClusterConfig,
}

impl Cluster {
    pub fn new(
        runner: Arc<dyn Runner>,
        sandbox: Arc<dyn SandboxManager>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            runner,
            sandbox,
            config,
        }
    }

    /// Namespace for an instance, falling back to the configured default.
    pub fn namespace_for<'a>(&'a self, instance: &'a ServiceInstance) -> &'a str {
        if instance.context.namespace.is_empty() {
            &self.config.namespace
        } else {
            &instance.context.namespace
        }
    }

    /// Destroy the sandbox of a run. Failures are logged, not returned: the
    /// caller's outcome never depends on teardown.
    pub async fn teardown(&self, handle: &str, namespace: &str) {
        if handle.is_empty() {
            debug!("no sandbox to tear down");
            return;
        }
        debug!(%handle, %namespace, "destroying sandbox");
        if let Err(e) = self.sandbox.destroy(handle, namespace).await {
            warn!(%handle, %namespace, error = %e, "sandbox teardown failed");
        }
    }
}
