//! Mock runner and sandbox for testing.
//!
//! Simulates automation runs in memory. Every call is recorded so tests can
//! assert on what the broker asked the cluster to do.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use broker_core::{ClusterConfig, ExtractedCredentials, Parameters, ServiceInstance};

use crate::error::{RunnerError, RunnerResult};
use crate::traits::{RunOutput, Runner, SandboxManager};

/// One recorded runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub action: &'static str,
    pub instance_id: Uuid,
    pub parameters: Option<Parameters>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    runs: HashMap<String, Option<ExtractedCredentials>>,
    next_handle: u64,
}

/// Mock runner for testing.
pub struct MockRunner {
    state: Mutex<MockState>,
    /// Credentials returned by successful provision runs.
    pub provision_credentials: Option<ExtractedCredentials>,
    /// Credentials returned by successful bind runs.
    pub bind_credentials: Option<ExtractedCredentials>,
    /// Actions that fail, keyed by action name.
    pub failures: HashMap<&'static str, String>,
    /// Simulated execution time of every run.
    pub delay: Duration,
    /// Makes `extract_credentials` fail for every handle.
    pub query_error: bool,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            provision_credentials: None,
            bind_credentials: None,
            failures: HashMap::new(),
            delay: Duration::ZERO,
            query_error: false,
        }
    }

    pub fn with_provision_credentials(mut self, creds: ExtractedCredentials) -> Self {
        self.provision_credentials = Some(creds);
        self
    }

    pub fn with_bind_credentials(mut self, creds: ExtractedCredentials) -> Self {
        self.bind_credentials = Some(creds);
        self
    }

    /// Make `action` ("provision", "deprovision", "bind", "unbind") fail.
    pub fn failing(mut self, action: &'static str, message: &str) -> Self {
        self.failures.insert(action, message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_query_error(mut self) -> Self {
        self.query_error = true;
        self
    }

    /// Mark a run as finished, optionally with credentials.
    pub async fn complete_run(&self, handle: &str, creds: Option<ExtractedCredentials>) {
        self.state.lock().await.runs.insert(handle.to_string(), creds);
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, action: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.action == action)
            .count()
    }

    async fn record(
        &self,
        action: &'static str,
        instance: &ServiceInstance,
        parameters: Option<&Parameters>,
    ) -> RunnerResult<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let handle = {
            let mut state = self.state.lock().await;
            state.calls.push(MockCall {
                action,
                instance_id: instance.id,
                parameters: parameters.cloned(),
            });
            state.next_handle += 1;
            format!("mock-{action}-{}", state.next_handle)
        };
        match self.failures.get(action) {
            Some(message) => Err(RunnerError::RunFailed {
                handle,
                message: message.clone(),
            }),
            None => Ok(handle),
        }
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn provision(
        &self,
        instance: &ServiceInstance,
        _cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput> {
        let handle = self
            .record("provision", instance, instance.parameters.as_ref())
            .await?;
        Ok(RunOutput {
            handle,
            credentials: self.provision_credentials.clone(),
        })
    }

    async fn deprovision(
        &self,
        instance: &ServiceInstance,
        _cluster: &ClusterConfig,
    ) -> RunnerResult<String> {
        self.record("deprovision", instance, instance.parameters.as_ref())
            .await
    }

    async fn bind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        _cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput> {
        let handle = self.record("bind", instance, Some(parameters)).await?;
        Ok(RunOutput {
            handle,
            credentials: self.bind_credentials.clone(),
        })
    }

    async fn unbind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        _cluster: &ClusterConfig,
    ) -> RunnerResult<()> {
        self.record("unbind", instance, Some(parameters)).await?;
        Ok(())
    }

    async fn extract_credentials(
        &self,
        handle: &str,
        _namespace: &str,
    ) -> RunnerResult<Option<ExtractedCredentials>> {
        if self.query_error {
            return Err(RunnerError::RunNotFound(handle.to_string()));
        }
        Ok(self.state.lock().await.runs.get(handle).cloned().flatten())
    }
}

/// Mock sandbox manager that records creations and teardowns.
#[derive(Default)]
pub struct MockSandbox {
    created: Mutex<Vec<(String, String)>>,
    destroyed: Mutex<Vec<(String, String)>>,
    /// Makes every `destroy` fail.
    pub fail_destroy: bool,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_destroy: true,
            ..Self::default()
        }
    }

    /// `(handle, namespace)` pairs passed to `destroy`, in call order.
    pub async fn destroyed(&self) -> Vec<(String, String)> {
        self.destroyed.lock().await.clone()
    }

    pub async fn created(&self) -> Vec<(String, String)> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl SandboxManager for MockSandbox {
    async fn create(&self, namespace: &str, id: &str) -> RunnerResult<String> {
        self.created
            .lock()
            .await
            .push((namespace.to_string(), id.to_string()));
        Ok(id.to_string())
    }

    async fn destroy(&self, handle: &str, namespace: &str) -> RunnerResult<()> {
        if handle.is_empty() {
            return Ok(());
        }
        self.destroyed
            .lock()
            .await
            .push((handle.to_string(), namespace.to_string()));
        if self.fail_destroy {
            return Err(RunnerError::Sandbox(format!("cannot destroy {handle}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{Context, Spec};
    use serde_json::json;

    fn instance() -> ServiceInstance {
        let spec: Spec = serde_json::from_value(json!({"image": "org/app"})).unwrap();
        ServiceInstance::new(Uuid::new_v4(), spec, Context::default(), Parameters::new())
    }

    #[tokio::test]
    async fn records_calls_and_returns_credentials() {
        let creds = ExtractedCredentials::new(
            json!({"password": "p"}).as_object().unwrap().clone(),
        );
        let runner = MockRunner::new().with_provision_credentials(creds.clone());
        let out = runner
            .provision(&instance(), &ClusterConfig::default())
            .await
            .unwrap();
        assert_eq!(out.credentials, Some(creds));
        assert!(out.handle.starts_with("mock-provision-"));
        assert_eq!(runner.call_count("provision").await, 1);
    }

    #[tokio::test]
    async fn failing_action_keeps_handle() {
        let runner = MockRunner::new().failing("deprovision", "boom");
        let err = runner
            .deprovision(&instance(), &ClusterConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(err.handle().starts_with("mock-deprovision-"));
    }

    #[tokio::test]
    async fn extract_credentials_reflects_completed_runs() {
        let runner = MockRunner::new();
        assert_eq!(runner.extract_credentials("pod-1", "ns").await.unwrap(), None);
        runner
            .complete_run("pod-1", Some(ExtractedCredentials::default()))
            .await;
        assert!(runner.extract_credentials("pod-1", "ns").await.unwrap().is_some());

        let broken = MockRunner::new().with_query_error();
        assert!(broken.extract_credentials("pod-1", "ns").await.is_err());
    }

    #[tokio::test]
    async fn sandbox_records_teardown() {
        let sandbox = MockSandbox::failing();
        sandbox.destroy("", "ns").await.unwrap();
        assert!(sandbox.destroy("h", "ns").await.is_err());
        assert_eq!(sandbox.destroyed().await, vec![("h".into(), "ns".into())]);
    }
}
