//! Process-backed runner.
//!
//! Each action runs the configured program as `{program} {action}` with the
//! run's working directory set to a fresh sandbox directory
//! `{work_dir}/{namespace}/{handle}`. The instance, its spec, the action's
//! parameters and the cluster settings are written to stdin as one JSON
//! document. A zero exit status means success; a JSON object on stdout is
//! taken as the run's credentials.
//!
//! Credentials are also recorded at `{work_dir}/{namespace}/.credentials/{handle}.json`,
//! outside the sandbox, so a query still finds them after the sandbox is
//! torn down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use broker_core::{ClusterConfig, ExtractedCredentials, Parameters, ServiceInstance, Spec};

use crate::error::{RunnerError, RunnerResult};
use crate::traits::{RunOutput, Runner, SandboxManager};

const CREDENTIALS_DIR: &str = ".credentials";

/// Sandboxes as directories under a root.
#[derive(Debug, Clone)]
pub struct DirSandbox {
    root: PathBuf,
}

impl DirSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, handle: &str, namespace: &str) -> PathBuf {
        self.root.join(namespace).join(handle)
    }

    /// Where the credentials of a finished run are recorded.
    pub fn credentials_path(&self, handle: &str, namespace: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(CREDENTIALS_DIR)
            .join(format!("{handle}.json"))
    }
}

#[async_trait]
impl SandboxManager for DirSandbox {
    async fn create(&self, namespace: &str, id: &str) -> RunnerResult<String> {
        let dir = self.path(id, namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RunnerError::Sandbox(format!("create {}: {e}", dir.display())))?;
        info!(sandbox = %id, %namespace, "sandbox created");
        Ok(id.to_string())
    }

    async fn destroy(&self, handle: &str, namespace: &str) -> RunnerResult<()> {
        if handle.is_empty() {
            debug!("destroy requested with empty handle, skipping");
            return Ok(());
        }
        let dir = self.path(handle, namespace);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(sandbox = %handle, %namespace, "sandbox destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RunnerError::Sandbox(format!(
                "destroy {}: {e}",
                dir.display()
            ))),
        }
    }
}

#[derive(Serialize)]
struct RunRequest<'a> {
    action: &'a str,
    image: &'a str,
    instance_id: &'a Uuid,
    namespace: &'a str,
    spec: &'a Spec,
    parameters: &'a Parameters,
    cluster: &'a ClusterConfig,
}

/// Runs automation actions as child processes.
pub struct CommandRunner {
    program: PathBuf,
    sandbox: Arc<DirSandbox>,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, sandbox: Arc<DirSandbox>) -> Self {
        Self {
            program: program.into(),
            sandbox,
        }
    }

    async fn run(
        &self,
        action: &str,
        instance: &ServiceInstance,
        parameters: &Parameters,
        cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput> {
        let spec = instance
            .spec
            .as_ref()
            .ok_or(RunnerError::MissingSpec(instance.id))?;
        let namespace = namespace_of(instance, cluster);

        let id = format!("bundle-{}", Uuid::new_v4());
        let handle = self.sandbox.create(namespace, &id).await?;
        let dir = self.sandbox.path(&handle, namespace);

        let request = serde_json::to_vec(&RunRequest {
            action,
            image: &spec.image,
            instance_id: &instance.id,
            namespace,
            spec,
            parameters,
            cluster,
        })?;

        info!(%action, %handle, image = %spec.image, "starting automation run");
        let output = self
            .execute(action, &dir, &request)
            .await
            .map_err(|e| RunnerError::RunFailed {
                handle: handle.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(RunnerError::RunFailed {
                handle,
                message: format!("exit code {exit_code}: {}", stderr.trim()),
            });
        }

        let credentials = parse_credentials(&output.stdout).map_err(|e| RunnerError::RunFailed {
            handle: handle.clone(),
            message: format!("invalid credentials output: {e}"),
        })?;
        if let Some(creds) = &credentials {
            let path = self.sandbox.credentials_path(&handle, namespace);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, serde_json::to_vec(creds)?).await?;
        }

        debug!(%action, %handle, has_credentials = credentials.is_some(), "automation run finished");
        Ok(RunOutput {
            handle,
            credentials,
        })
    }

    async fn execute(
        &self,
        action: &str,
        dir: &Path,
        request: &[u8],
    ) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .arg(action)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(request).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e);
        }
        child.wait_with_output().await
    }
}

fn namespace_of<'a>(instance: &'a ServiceInstance, cluster: &'a ClusterConfig) -> &'a str {
    if instance.context.namespace.is_empty() {
        &cluster.namespace
    } else {
        &instance.context.namespace
    }
}

fn parse_credentials(stdout: &[u8]) -> serde_json::Result<Option<ExtractedCredentials>> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let credentials: Map<String, Value> = serde_json::from_str(text)?;
    Ok(Some(ExtractedCredentials::new(credentials)))
}

#[async_trait]
impl Runner for CommandRunner {
    async fn provision(
        &self,
        instance: &ServiceInstance,
        cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput> {
        let params = instance.parameters.clone().unwrap_or_default();
        self.run("provision", instance, &params, cluster).await
    }

    async fn deprovision(
        &self,
        instance: &ServiceInstance,
        cluster: &ClusterConfig,
    ) -> RunnerResult<String> {
        let params = instance.parameters.clone().unwrap_or_default();
        let output = self.run("deprovision", instance, &params, cluster).await?;
        Ok(output.handle)
    }

    async fn bind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        cluster: &ClusterConfig,
    ) -> RunnerResult<RunOutput> {
        self.run("bind", instance, parameters, cluster).await
    }

    async fn unbind(
        &self,
        instance: &ServiceInstance,
        parameters: &Parameters,
        cluster: &ClusterConfig,
    ) -> RunnerResult<()> {
        let output = self.run("unbind", instance, parameters, cluster).await?;
        // Unbind has no caller waiting on the handle, so clean up here.
        self.sandbox
            .destroy(&output.handle, namespace_of(instance, cluster))
            .await
    }

    async fn extract_credentials(
        &self,
        handle: &str,
        namespace: &str,
    ) -> RunnerResult<Option<ExtractedCredentials>> {
        match tokio::fs::read(self.sandbox.credentials_path(handle, namespace)).await {
            Ok(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // No result yet: the run is still going as long as its sandbox is.
        if tokio::fs::try_exists(self.sandbox.path(handle, namespace)).await? {
            Ok(None)
        } else {
            Err(RunnerError::RunNotFound(handle.to_string()))
        }
    }
}
