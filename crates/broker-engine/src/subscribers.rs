//! Subscribers that turn job completion messages into persisted state.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use broker_core::{ExtractedCredentials, JobMethod, JobState, ServiceInstance, State};
use broker_runner::Cluster;
use broker_state::Dao;

use crate::engine::{DEPROVISION_TOPIC, PROVISION_TOPIC, WorkEngine, WorkMsg, WorkSubscriber};
use crate::error::{BrokerError, BrokerResult, EngineResult};

/// Build an engine with both lifecycle subscribers attached.
pub async fn start_engine(dao: Dao, cluster: Cluster, buffer_size: usize) -> EngineResult<Arc<WorkEngine>> {
    let engine = Arc::new(WorkEngine::new(buffer_size));
    engine
        .attach_subscriber(
            Arc::new(ProvisionWorkSubscriber::new(dao.clone())),
            PROVISION_TOPIC,
        )
        .await?;
    engine
        .attach_subscriber(
            Arc::new(DeprovisionWorkSubscriber::new(dao, cluster)),
            DEPROVISION_TOPIC,
        )
        .await?;
    Ok(engine)
}

fn job_state(msg: &WorkMsg, state: State, method: JobMethod) -> JobState {
    JobState::new(&msg.job_token, state)
        .with_podname(&msg.podname)
        .with_method(method)
}

pub struct ProvisionWorkSubscriber {
    dao: Dao,
}

impl ProvisionWorkSubscriber {
    pub fn new(dao: Dao) -> Self {
        Self { dao }
    }
}

#[async_trait]
impl WorkSubscriber for ProvisionWorkSubscriber {
    async fn handle(&self, msg: WorkMsg) -> BrokerResult<()> {
        let id = msg.instance_uuid;

        if msg.is_error() {
            error!(instance_id = %id, token = %msg.job_token, error = %msg.error, "provision job failed");
            self.dao
                .set_state(&id, &job_state(&msg, State::Failed, JobMethod::Provision))?;
            return Ok(());
        }

        if msg.msg.is_empty() {
            debug!(instance_id = %id, token = %msg.job_token, "provision job still running");
            self.dao
                .set_state(&id, &job_state(&msg, State::InProgress, JobMethod::Provision))?;
            return Ok(());
        }

        let credentials: Option<ExtractedCredentials> = match serde_json::from_str(&msg.msg) {
            Ok(c) => c,
            Err(e) => {
                self.dao
                    .set_state(&id, &job_state(&msg, State::Failed, JobMethod::Provision))?;
                return Err(BrokerError::MalformedMessage(e.to_string()));
            }
        };

        // Credentials go in before the state flips, so a poller that sees
        // "succeeded" can read them.
        if let Some(creds) = &credentials {
            self.dao.set_extracted_credentials(&id, creds)?;
        }
        self.dao
            .set_state(&id, &job_state(&msg, State::Succeeded, JobMethod::Provision))?;
        info!(instance_id = %id, token = %msg.job_token, "provision job succeeded");
        Ok(())
    }
}

pub struct DeprovisionWorkSubscriber {
    dao: Dao,
    cluster: Cluster,
}

impl DeprovisionWorkSubscriber {
    pub fn new(dao: Dao, cluster: Cluster) -> Self {
        Self { dao, cluster }
    }

    fn fail(&self, msg: &WorkMsg) -> BrokerResult<()> {
        self.dao.set_state(
            &msg.instance_uuid,
            &job_state(msg, State::Failed, JobMethod::Deprovision),
        )?;
        Ok(())
    }
}

#[async_trait]
impl WorkSubscriber for DeprovisionWorkSubscriber {
    async fn handle(&self, msg: WorkMsg) -> BrokerResult<()> {
        let id = msg.instance_uuid;

        if msg.is_error() {
            error!(instance_id = %id, token = %msg.job_token, error = %msg.error, "deprovision job failed");
            return self.fail(&msg);
        }

        let instance = match self.dao.get_service_instance(&id) {
            Ok(instance) => instance,
            Err(e) => {
                self.fail(&msg)?;
                return Err(e.into());
            }
        };

        if let Err(e) = cleanup_deprovision(&msg.podname, &instance, &self.dao, &self.cluster).await {
            self.fail(&msg)?;
            return Err(e);
        }

        self.dao.set_state(
            &id,
            &job_state(&msg, State::Succeeded, JobMethod::Deprovision),
        )?;
        info!(instance_id = %id, token = %msg.job_token, "deprovision job succeeded");
        Ok(())
    }
}

/// Remove everything a finished deprovision leaves behind: the run's
/// sandbox, the instance's credentials and the instance record.
///
/// Teardown failures are logged and do not stop the cleanup.
pub async fn cleanup_deprovision(
    handle: &str,
    instance: &ServiceInstance,
    dao: &Dao,
    cluster: &Cluster,
) -> BrokerResult<()> {
    if instance.has_bindings() {
        warn!(instance_id = %instance.id, "instance gained bindings, keeping its records");
        return Err(BrokerError::BindingExists(instance.id));
    }

    cluster
        .teardown(handle, cluster.namespace_for(instance))
        .await;
    dao.delete_extracted_credentials(&instance.id)?;
    dao.delete_service_instance(&instance.id)?;
    debug!(instance_id = %instance.id, "instance records removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{ClusterConfig, Context, Parameters, Spec};
    use broker_runner::{MockRunner, MockSandbox};
    use broker_state::StateStore;
    use serde_json::json;
    use uuid::Uuid;

    fn dao() -> Dao {
        Dao::new(StateStore::open_in_memory().unwrap())
    }

    fn cluster(sandbox: Arc<MockSandbox>) -> Cluster {
        Cluster::new(Arc::new(MockRunner::new()), sandbox, ClusterConfig::default())
    }

    fn instance() -> ServiceInstance {
        let spec: Spec = serde_json::from_value(json!({"id": "s1", "image": "org/app"})).unwrap();
        ServiceInstance::new(
            Uuid::new_v4(),
            spec,
            Context {
                platform: "kubernetes".into(),
                namespace: "ns".into(),
            },
            Parameters::new(),
        )
    }

    fn msg(id: Uuid) -> WorkMsg {
        let mut m = WorkMsg::new(id, "tok", "s1");
        m.podname = "pod-1".into();
        m
    }

    #[tokio::test]
    async fn provision_success_stores_credentials() {
        let dao = dao();
        let id = Uuid::new_v4();
        let mut m = msg(id);
        m.msg = r#"{"credentials":{"user":"u"}}"#.into();

        ProvisionWorkSubscriber::new(dao.clone()).handle(m).await.unwrap();

        let state = dao.get_state(&id, "tok").unwrap();
        assert_eq!(state.state, State::Succeeded);
        assert_eq!(state.podname, "pod-1");
        assert_eq!(dao.get_extracted_credentials(&id).unwrap().credentials["user"], "u");
    }

    #[tokio::test]
    async fn provision_without_credentials_still_succeeds() {
        let dao = dao();
        let id = Uuid::new_v4();
        let mut m = msg(id);
        m.msg = "null".into();

        ProvisionWorkSubscriber::new(dao.clone()).handle(m).await.unwrap();

        assert_eq!(dao.get_state(&id, "tok").unwrap().state, State::Succeeded);
        assert!(dao.get_extracted_credentials(&id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn provision_error_and_progress_messages() {
        let dao = dao();
        let sub = ProvisionWorkSubscriber::new(dao.clone());
        let id = Uuid::new_v4();

        sub.handle(msg(id)).await.unwrap();
        assert_eq!(dao.get_state(&id, "tok").unwrap().state, State::InProgress);

        let mut failed = msg(id);
        failed.error = "boom".into();
        sub.handle(failed).await.unwrap();
        let state = dao.get_state(&id, "tok").unwrap();
        assert_eq!(state.state, State::Failed);
        assert_eq!(state.podname, "pod-1");
    }

    #[tokio::test]
    async fn malformed_payload_marks_failed() {
        let dao = dao();
        let id = Uuid::new_v4();
        let mut m = msg(id);
        m.msg = "{not json".into();

        let err = ProvisionWorkSubscriber::new(dao.clone()).handle(m).await.unwrap_err();
        assert!(matches!(err, BrokerError::MalformedMessage(_)));
        assert_eq!(dao.get_state(&id, "tok").unwrap().state, State::Failed);
    }

    #[tokio::test]
    async fn deprovision_success_removes_records() {
        let dao = dao();
        let sandbox = Arc::new(MockSandbox::new());
        let inst = instance();
        dao.set_service_instance(&inst).unwrap();
        dao.set_extracted_credentials(&inst.id, &ExtractedCredentials::default())
            .unwrap();

        DeprovisionWorkSubscriber::new(dao.clone(), cluster(sandbox.clone()))
            .handle(msg(inst.id))
            .await
            .unwrap();

        let state = dao.get_state(&inst.id, "tok").unwrap();
        assert_eq!(state.state, State::Succeeded);
        assert_eq!(state.method, JobMethod::Deprovision);
        assert!(dao.get_service_instance(&inst.id).unwrap_err().is_not_found());
        assert!(dao.get_extracted_credentials(&inst.id).unwrap_err().is_not_found());
        assert_eq!(sandbox.destroyed().await, vec![("pod-1".into(), "ns".into())]);
    }

    #[tokio::test]
    async fn deprovision_of_missing_instance_fails() {
        let dao = dao();
        let id = Uuid::new_v4();
        let sub = DeprovisionWorkSubscriber::new(dao.clone(), cluster(Arc::new(MockSandbox::new())));

        assert!(sub.handle(msg(id)).await.is_err());
        assert_eq!(dao.get_state(&id, "tok").unwrap().state, State::Failed);
    }

    #[tokio::test]
    async fn teardown_failure_does_not_block_cleanup() {
        let dao = dao();
        let inst = instance();
        dao.set_service_instance(&inst).unwrap();

        cleanup_deprovision("pod-1", &inst, &dao, &cluster(Arc::new(MockSandbox::failing())))
            .await
            .unwrap();
        assert!(dao.get_service_instance(&inst.id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cleanup_keeps_bound_instance() {
        let dao = dao();
        let mut inst = instance();
        inst.add_binding(Uuid::new_v4());
        dao.set_service_instance(&inst).unwrap();

        let err = cleanup_deprovision("pod-1", &inst, &dao, &cluster(Arc::new(MockSandbox::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BindingExists(_)));
        assert!(dao.get_service_instance(&inst.id).is_ok());
    }
}
