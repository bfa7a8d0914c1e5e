//! Dao: maps broker entities onto store keys.
//!
//! This is the only place that knows the key layout:
//!
//! | Entity               | Key                                   |
//! |----------------------|---------------------------------------|
//! | Spec                 | `/spec/{spec_id}`                     |
//! | ServiceInstance      | `/service_instance/{instance_id}`     |
//! | BindInstance         | `/bind_instance/{binding_id}`         |
//! | JobState             | `/state/{instance_id}/job/{token}`    |
//! | ExtractedCredentials | `/extracted_credentials/{id}`         |
//!
//! Deletes are idempotent: removing an absent key is not an error.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use broker_core::{
    BindInstance, ExtractedCredentials, JobState, RecoverStatus, ServiceInstance, Spec, State,
};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

pub const SPEC_DIR: &str = "/spec/";
pub const STATE_DIR: &str = "/state/";

pub fn spec_key(id: &str) -> String {
    format!("/spec/{id}")
}

pub fn service_instance_key(id: &Uuid) -> String {
    format!("/service_instance/{id}")
}

pub fn bind_instance_key(id: &Uuid) -> String {
    format!("/bind_instance/{id}")
}

pub fn state_key(instance_id: &Uuid, token: &str) -> String {
    format!("/state/{instance_id}/job/{token}")
}

pub fn extracted_credentials_key(id: &Uuid) -> String {
    format!("/extracted_credentials/{id}")
}

/// Split `/state/{instance}/job/{token}` into its instance ID and token.
fn parse_state_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(STATE_DIR)?;
    let (instance, token) = rest.split_once("/job/")?;
    (!instance.is_empty() && !token.is_empty()).then_some((instance, token))
}

/// Typed access to broker records.
#[derive(Clone)]
pub struct Dao {
    store: StateStore,
}

impl Dao {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn get_raw(&self, key: &str) -> StateResult<String> {
        self.store.get(key)
    }

    pub fn set_raw(&self, key: &str, value: &str) -> StateResult<()> {
        self.store.set(key, value)
    }

    fn get_object<T: DeserializeOwned>(&self, key: &str) -> StateResult<T> {
        let raw = self.store.get(key)?;
        serde_json::from_str(&raw).map_err(|e| StateError::Deserialize(format!("{key}: {e}")))
    }

    fn set_object<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let payload =
            serde_json::to_string(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.store.set(key, &payload)
    }

    fn delete_key(&self, key: &str) -> StateResult<()> {
        if !self.store.delete(key)? {
            debug!(%key, "delete of absent key");
        }
        Ok(())
    }

    // ── Specs ──────────────────────────────────────────────────────

    pub fn get_spec(&self, id: &str) -> StateResult<Spec> {
        self.get_object(&spec_key(id))
    }

    pub fn set_spec(&self, spec: &Spec) -> StateResult<()> {
        self.set_object(&spec_key(&spec.id), spec)
    }

    pub fn delete_spec(&self, id: &str) -> StateResult<()> {
        debug!(spec_id = %id, "deleting spec");
        self.delete_key(&spec_key(id))
    }

    pub fn batch_set_specs(&self, specs: &[Spec]) -> StateResult<()> {
        for spec in specs {
            self.set_spec(spec)?;
        }
        Ok(())
    }

    /// Every stored spec. Records that fail to decode are skipped.
    pub fn batch_get_specs(&self) -> StateResult<Vec<Spec>> {
        let entries = self.store.list_recursive(SPEC_DIR)?;
        let mut specs = Vec::with_capacity(entries.len());
        for (key, payload) in entries {
            match serde_json::from_str::<Spec>(&payload) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(%key, error = %e, "skipping undecodable spec"),
            }
        }
        debug!(count = specs.len(), "loaded specs");
        Ok(specs)
    }

    pub fn batch_delete_specs(&self, specs: &[Spec]) -> StateResult<()> {
        for spec in specs {
            self.delete_spec(&spec.id)?;
        }
        Ok(())
    }

    // ── Service instances ──────────────────────────────────────────

    pub fn get_service_instance(&self, id: &Uuid) -> StateResult<ServiceInstance> {
        self.get_object(&service_instance_key(id))
    }

    pub fn set_service_instance(&self, instance: &ServiceInstance) -> StateResult<()> {
        self.set_object(&service_instance_key(&instance.id), instance)
    }

    pub fn delete_service_instance(&self, id: &Uuid) -> StateResult<()> {
        debug!(instance_id = %id, "deleting service instance");
        self.delete_key(&service_instance_key(id))
    }

    // ── Bind instances ─────────────────────────────────────────────

    pub fn get_bind_instance(&self, id: &Uuid) -> StateResult<BindInstance> {
        self.get_object(&bind_instance_key(id))
    }

    pub fn set_bind_instance(&self, binding: &BindInstance) -> StateResult<()> {
        self.set_object(&bind_instance_key(&binding.id), binding)
    }

    pub fn delete_bind_instance(&self, id: &Uuid) -> StateResult<()> {
        debug!(binding_id = %id, "deleting bind instance");
        self.delete_key(&bind_instance_key(id))
    }

    /// Remove the binding record and detach it from its instance.
    pub fn delete_binding(
        &self,
        binding: &BindInstance,
        instance: &mut ServiceInstance,
    ) -> StateResult<()> {
        self.delete_bind_instance(&binding.id)?;
        instance.remove_binding(&binding.id);
        self.set_service_instance(instance)
    }

    // ── Job states ─────────────────────────────────────────────────

    /// Persist a job state and return the key it was written under.
    pub fn set_state(&self, instance_id: &Uuid, state: &JobState) -> StateResult<String> {
        let key = state_key(instance_id, &state.token);
        self.set_object(&key, state)?;
        debug!(%key, state = %state.state, "job state stored");
        Ok(key)
    }

    pub fn get_state(&self, instance_id: &Uuid, token: &str) -> StateResult<JobState> {
        self.get_object(&state_key(instance_id, token))
    }

    /// Every job state, across all instances, currently in `state`.
    pub fn find_job_states_by_state(&self, state: State) -> StateResult<Vec<RecoverStatus>> {
        let entries = self.store.list_recursive(STATE_DIR)?;
        let mut found = Vec::new();
        for (key, payload) in entries {
            let Some((instance, _)) = parse_state_key(&key) else {
                warn!(%key, "skipping malformed job state key");
                continue;
            };
            let Ok(instance_id) = Uuid::parse_str(instance) else {
                warn!(%key, "skipping job state with invalid instance id");
                continue;
            };
            let job: JobState = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    warn!(%key, error = %e, "skipping undecodable job state");
                    continue;
                }
            };
            if job.state == state {
                found.push(RecoverStatus { instance_id, state: job });
            }
        }
        debug!(%state, count = found.len(), "job states matched");
        Ok(found)
    }

    /// Job states of one instance currently in `state`.
    pub fn get_svc_inst_jobs_by_state(
        &self,
        instance_id: &Uuid,
        state: State,
    ) -> StateResult<Vec<JobState>> {
        let prefix = format!("{STATE_DIR}{instance_id}/job/");
        let mut jobs = Vec::new();
        for (key, payload) in self.store.list_recursive(&prefix)? {
            let job: JobState = serde_json::from_str(&payload)
                .map_err(|e| StateError::Deserialize(format!("{key}: {e}")))?;
            if job.state == state {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // ── Extracted credentials ──────────────────────────────────────

    pub fn get_extracted_credentials(&self, id: &Uuid) -> StateResult<ExtractedCredentials> {
        self.get_object(&extracted_credentials_key(id))
    }

    pub fn set_extracted_credentials(
        &self,
        id: &Uuid,
        credentials: &ExtractedCredentials,
    ) -> StateResult<()> {
        self.set_object(&extracted_credentials_key(id), credentials)
    }

    pub fn delete_extracted_credentials(&self, id: &Uuid) -> StateResult<()> {
        self.delete_key(&extracted_credentials_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{Context, Parameters};
    use serde_json::json;

    fn dao() -> Dao {
        Dao::new(StateStore::open_in_memory().unwrap())
    }

    fn test_spec(id: &str) -> Spec {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("h-{id}"),
            "image": format!("org/{id}"),
            "description": "test",
            "plans": [{"name": "default"}],
        }))
        .unwrap()
    }

    fn test_instance() -> ServiceInstance {
        let mut params = Parameters::new();
        params.insert("size".into(), json!(3));
        ServiceInstance::new(
            Uuid::new_v4(),
            test_spec("s1"),
            Context {
                platform: "kubernetes".into(),
                namespace: "ns".into(),
            },
            params,
        )
    }

    #[test]
    fn key_layout() {
        let id = Uuid::nil();
        assert_eq!(spec_key("abc"), "/spec/abc");
        assert_eq!(
            service_instance_key(&id),
            "/service_instance/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            state_key(&id, "tok"),
            "/state/00000000-0000-0000-0000-000000000000/job/tok"
        );
        assert!(bind_instance_key(&id).starts_with("/bind_instance/"));
        assert!(extracted_credentials_key(&id).starts_with("/extracted_credentials/"));
    }

    #[test]
    fn parse_state_keys() {
        assert_eq!(parse_state_key("/state/a/job/t"), Some(("a", "t")));
        assert_eq!(parse_state_key("/state/a/job/"), None);
        assert_eq!(parse_state_key("/spec/a"), None);
    }

    #[test]
    fn spec_batch_operations() {
        let dao = dao();
        dao.batch_set_specs(&[test_spec("a"), test_spec("b")]).unwrap();
        assert_eq!(dao.get_spec("a").unwrap().fq_name, "h-a");

        let all = dao.batch_get_specs().unwrap();
        assert_eq!(all.len(), 2);

        dao.batch_delete_specs(&all).unwrap();
        assert!(dao.batch_get_specs().unwrap().is_empty());
        assert!(dao.get_spec("a").unwrap_err().is_not_found());
    }

    #[test]
    fn service_instance_round_trip_and_delete() {
        let dao = dao();
        let inst = test_instance();
        dao.set_service_instance(&inst).unwrap();
        assert_eq!(dao.get_service_instance(&inst.id).unwrap(), inst);

        dao.delete_service_instance(&inst.id).unwrap();
        // Second delete is a no-op.
        dao.delete_service_instance(&inst.id).unwrap();
        assert!(dao.get_service_instance(&inst.id).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_binding_detaches_from_instance() {
        let dao = dao();
        let mut inst = test_instance();
        let binding = BindInstance {
            id: Uuid::new_v4(),
            service_id: inst.id,
            parameters: None,
        };
        inst.add_binding(binding.id);
        dao.set_service_instance(&inst).unwrap();
        dao.set_bind_instance(&binding).unwrap();

        dao.delete_binding(&binding, &mut inst).unwrap();

        assert!(dao.get_bind_instance(&binding.id).unwrap_err().is_not_found());
        assert!(!dao.get_service_instance(&inst.id).unwrap().has_bindings());
    }

    #[test]
    fn find_job_states_filters_by_state() {
        let dao = dao();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        dao.set_state(&a, &JobState::new("t1", State::InProgress)).unwrap();
        dao.set_state(&a, &JobState::new("t2", State::Succeeded)).unwrap();
        dao.set_state(&b, &JobState::new("t3", State::InProgress).with_podname("pod-3"))
            .unwrap();
        dao.set_raw("/state/not-a-uuid/job/t4", r#"{"token":"t4","state":"in progress"}"#)
            .unwrap();

        let mut found = dao.find_job_states_by_state(State::InProgress).unwrap();
        found.sort_by(|x, y| x.state.token.cmp(&y.state.token));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].instance_id, a);
        assert_eq!(found[1].state.podname, "pod-3");

        let done = dao.get_svc_inst_jobs_by_state(&a, State::Succeeded).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, "t2");
    }

    #[test]
    fn state_overwrite_keeps_one_record() {
        let dao = dao();
        let id = Uuid::new_v4();
        dao.set_state(&id, &JobState::new("t", State::InProgress)).unwrap();
        dao.set_state(&id, &JobState::new("t", State::Failed)).unwrap();
        assert_eq!(dao.get_state(&id, "t").unwrap().state, State::Failed);
        assert!(dao.find_job_states_by_state(State::InProgress).unwrap().is_empty());
    }

    #[test]
    fn credentials_round_trip() {
        let dao = dao();
        let id = Uuid::new_v4();
        let mut creds = serde_json::Map::new();
        creds.insert("user".into(), json!("admin"));
        let creds = ExtractedCredentials::new(creds);

        dao.set_extracted_credentials(&id, &creds).unwrap();
        assert_eq!(dao.get_extracted_credentials(&id).unwrap(), creds);

        dao.delete_extracted_credentials(&id).unwrap();
        assert!(dao.get_extracted_credentials(&id).unwrap_err().is_not_found());
    }
}
