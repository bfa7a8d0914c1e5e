//! Broker: the service lifecycle operations.
//!
//! Every operation validates the request against the stored catalog and
//! instance records, then either drives the cluster runner inline or hands
//! a job to the [`WorkEngine`] and returns a token to poll with.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use broker_core::{
    AsyncSupport, BIND_CREDENTIALS_KEY, BindInstance, BrokerConfig, ExtractedCredentials,
    JobMethod, JobState, PLAN_PARAMETER_KEY, PROVISION_CREDENTIALS_KEY, Parameters,
    ServiceInstance, Spec, State, validate_spec,
};
use broker_runner::Cluster;
use broker_state::Dao;

use crate::catalog::Service;
use crate::engine::{DEPROVISION_TOPIC, PROVISION_TOPIC, WorkEngine};
use crate::error::{BrokerError, BrokerResult, not_found};
use crate::jobs::{DeprovisionJob, ProvisionJob};
use crate::registry::Registry;
use crate::requests::*;
use crate::subscribers::cleanup_deprovision;

/// Registry name given to specs added through [`Broker::add_spec`].
pub const PUSH_REGISTRY: &str = "push";

const PROVISION_PARAMS_KEY: &str = "provision_params";
const BIND_PARAMS_KEY: &str = "bind_params";

pub struct Broker {
    pub(crate) dao: Dao,
    pub(crate) cluster: Cluster,
    pub(crate) engine: Arc<WorkEngine>,
    registries: Vec<Arc<dyn Registry>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        dao: Dao,
        cluster: Cluster,
        engine: Arc<WorkEngine>,
        registries: Vec<Arc<dyn Registry>>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            dao,
            cluster,
            engine,
            registries,
            config,
        }
    }

    pub fn dao(&self) -> &Dao {
        &self.dao
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn get_instance(&self, id: &Uuid) -> BrokerResult<ServiceInstance> {
        self.dao
            .get_service_instance(id)
            .map_err(|e| not_found(e, || format!("service instance {id}")))
    }

    /// Credentials stored under `id`, if any. A miss is not an error.
    fn optional_credentials(&self, id: &Uuid) -> BrokerResult<Option<ExtractedCredentials>> {
        match self.dao.get_extracted_credentials(id) {
            Ok(creds) => Ok(Some(creds)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Catalog ────────────────────────────────────────────────────

    /// Replace the stored catalog with the specs every registry offers.
    pub async fn bootstrap(&self) -> BrokerResult<BootstrapResponse> {
        info!(registries = self.registries.len(), "bootstrapping catalog");

        let existing = self.dao.batch_get_specs()?;
        self.dao.batch_delete_specs(&existing)?;

        let mut loaded: Vec<Spec> = Vec::new();
        let mut image_count = 0;
        let mut failed = 0;
        for registry in &self.registries {
            match registry.load_specs().await {
                Ok((specs, images)) => {
                    image_count += images;
                    for mut spec in specs {
                        spec.assign_identity(registry.name());
                        loaded.push(spec);
                    }
                }
                Err(e) if registry.fail(&e) => {
                    error!(registry = %registry.name(), error = %e, "registry failed, aborting bootstrap");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(registry = %registry.name(), error = %e, "registry failed, skipping");
                    failed += 1;
                }
            }
        }

        if !self.registries.is_empty() && failed == self.registries.len() {
            return Err(BrokerError::AllRegistriesFailed);
        }

        let mut manifest: BTreeMap<String, Spec> = BTreeMap::new();
        for spec in loaded {
            if let Err(e) = validate_spec(&spec) {
                warn!(spec = %spec.fq_name, error = %e, "skipping invalid spec");
                continue;
            }
            manifest.insert(spec.id.clone(), spec);
        }
        let specs: Vec<Spec> = manifest.into_values().collect();
        self.dao.batch_set_specs(&specs)?;

        info!(specs = specs.len(), images = image_count, "catalog bootstrapped");
        Ok(BootstrapResponse {
            spec_count: specs.len(),
            image_count,
        })
    }

    pub async fn catalog(&self) -> BrokerResult<CatalogResponse> {
        let services = self
            .dao
            .batch_get_specs()?
            .iter()
            .map(Service::from)
            .collect();
        Ok(CatalogResponse { services })
    }

    /// Add a single spec to the catalog. Requires `dev_broker`.
    pub async fn add_spec(&self, mut spec: Spec) -> BrokerResult<Service> {
        if !self.config.dev_broker {
            return Err(BrokerError::DevBrokerDisabled);
        }
        spec.assign_identity(PUSH_REGISTRY);
        validate_spec(&spec)?;
        self.dao.set_spec(&spec)?;
        info!(spec = %spec.fq_name, id = %spec.id, "spec added");
        Ok(Service::from(&spec))
    }

    pub async fn remove_spec(&self, spec_id: &str) -> BrokerResult<()> {
        if !self.config.dev_broker {
            return Err(BrokerError::DevBrokerDisabled);
        }
        let spec = self
            .dao
            .get_spec(spec_id)
            .map_err(|e| not_found(e, || format!("spec {spec_id}")))?;
        self.dao.delete_spec(&spec.id)?;
        info!(spec = %spec.fq_name, "spec removed");
        Ok(())
    }

    pub async fn remove_specs(&self) -> BrokerResult<usize> {
        if !self.config.dev_broker {
            return Err(BrokerError::DevBrokerDisabled);
        }
        let specs = self.dao.batch_get_specs()?;
        self.dao.batch_delete_specs(&specs)?;
        info!(count = specs.len(), "all specs removed");
        Ok(specs.len())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub async fn provision(
        &self,
        instance_id: Uuid,
        req: ProvisionRequest,
        accepts_incomplete: bool,
    ) -> BrokerResult<ProvisionOutcome> {
        let spec = self
            .dao
            .get_spec(&req.service_id)
            .map_err(|e| not_found(e, || format!("spec {}", req.service_id)))?;

        if req.plan_id.is_empty() {
            return Err(BrokerError::Validation(
                "plan_id is required to provision".into(),
            ));
        }

        let run_async = match spec.async_support {
            AsyncSupport::Required if !accepts_incomplete => {
                return Err(BrokerError::AsyncRequired(spec.fq_name));
            }
            AsyncSupport::Unsupported => false,
            _ => accepts_incomplete,
        };

        let mut parameters = req.parameters;
        parameters.insert(PLAN_PARAMETER_KEY.into(), Value::String(req.plan_id));
        let instance = ServiceInstance::new(instance_id, spec, req.context, parameters);

        match self.dao.get_service_instance(&instance_id) {
            Ok(existing) if existing.parameters == instance.parameters => {
                debug!(%instance_id, "instance already provisioned with the same parameters");
                return Ok(ProvisionOutcome::AlreadyProvisioned);
            }
            Ok(_) => return Err(BrokerError::Duplicate(instance_id)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.dao.set_service_instance(&instance)?;

        if run_async {
            let operation = self
                .start_job(&instance, JobMethod::Provision)
                .await?;
            info!(%instance_id, %operation, "provision accepted");
            return Ok(ProvisionOutcome::InProgress { operation });
        }

        let namespace = self.cluster.namespace_for(&instance);
        let result = self
            .cluster
            .runner
            .provision(&instance, &self.cluster.config)
            .await;
        let handle = match &result {
            Ok(output) => output.handle.as_str(),
            Err(e) => e.handle(),
        };
        self.cluster.teardown(handle, namespace).await;

        let output = result?;
        if let Some(creds) = &output.credentials {
            self.dao.set_extracted_credentials(&instance_id, creds)?;
        }
        info!(%instance_id, "instance provisioned");
        Ok(ProvisionOutcome::Created)
    }

    pub async fn deprovision(
        &self,
        instance_id: Uuid,
        req: DeprovisionRequest,
        accepts_incomplete: bool,
    ) -> BrokerResult<DeprovisionOutcome> {
        let instance = self.get_instance(&instance_id)?;

        if req.plan_id.is_empty() {
            return Err(BrokerError::Validation(
                "plan_id is required to deprovision".into(),
            ));
        }
        if instance.has_bindings() {
            return Err(BrokerError::BindingExists(instance_id));
        }

        let run_async = accepts_incomplete
            && instance
                .spec
                .as_ref()
                .is_none_or(|s| s.async_support != AsyncSupport::Unsupported);

        if run_async {
            let operation = self
                .start_job(&instance, JobMethod::Deprovision)
                .await?;
            info!(%instance_id, %operation, "deprovision accepted");
            return Ok(DeprovisionOutcome::InProgress { operation });
        }

        let handle = match self
            .cluster
            .runner
            .deprovision(&instance, &self.cluster.config)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.cluster
                    .teardown(e.handle(), self.cluster.namespace_for(&instance))
                    .await;
                return Err(e.into());
            }
        };
        cleanup_deprovision(&handle, &instance, &self.dao, &self.cluster).await?;
        info!(%instance_id, "instance deprovisioned");
        Ok(DeprovisionOutcome::Removed)
    }

    /// Record the job as in progress, then start it.
    ///
    /// The state is written first so a fast job's terminal state is never
    /// overwritten by the in-progress marker.
    pub(crate) async fn start_job(
        &self,
        instance: &ServiceInstance,
        method: JobMethod,
    ) -> BrokerResult<String> {
        let token = Uuid::new_v4().to_string();
        self.restart_job(instance, method, &token).await?;
        Ok(token)
    }

    pub(crate) async fn restart_job(
        &self,
        instance: &ServiceInstance,
        method: JobMethod,
        token: &str,
    ) -> BrokerResult<()> {
        let state = JobState::new(token, State::InProgress).with_method(method);
        self.dao.set_state(&instance.id, &state)?;

        let started = match method {
            JobMethod::Provision => {
                let job = ProvisionJob::new(instance.clone(), self.cluster.clone());
                self.engine.start_new_job(token, job, PROVISION_TOPIC).await
            }
            JobMethod::Deprovision => {
                let job = DeprovisionJob::new(instance.clone(), self.cluster.clone());
                self.engine.start_new_job(token, job, DEPROVISION_TOPIC).await
            }
        };

        if let Err(e) = started {
            self.dao.set_state(
                &instance.id,
                &JobState::new(token, State::Failed).with_method(method),
            )?;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn bind(
        &self,
        instance_id: Uuid,
        binding_id: Uuid,
        req: BindRequest,
    ) -> BrokerResult<BindOutcome> {
        let mut instance = self.get_instance(&instance_id)?;

        if req.plan_id.is_empty() {
            return Err(BrokerError::Validation("plan_id is required to bind".into()));
        }

        let mut params = Parameters::new();
        if let Some(provision_params) = &instance.parameters {
            params.insert(
                PROVISION_PARAMS_KEY.into(),
                Value::Object(provision_params.clone()),
            );
        }
        params.insert(BIND_PARAMS_KEY.into(), Value::Object(req.parameters));
        params.insert(PLAN_PARAMETER_KEY.into(), Value::String(req.plan_id));

        let binding = BindInstance {
            id: binding_id,
            service_id: instance_id,
            parameters: Some(params.clone()),
        };

        match self.dao.get_bind_instance(&binding_id) {
            Ok(existing) if existing.parameters == binding.parameters => {
                debug!(%binding_id, "binding already exists with the same parameters");
                return Ok(BindOutcome::AlreadyBound);
            }
            Ok(_) => return Err(BrokerError::Duplicate(binding_id)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.dao.set_bind_instance(&binding)?;

        let provision_creds = self.optional_credentials(&instance_id)?;
        if let Some(creds) = &provision_creds {
            params.insert(
                PROVISION_CREDENTIALS_KEY.into(),
                Value::Object(creds.credentials.clone()),
            );
        }

        let mut bind_creds = None;
        if self.config.launch_on_bind {
            info!(%instance_id, %binding_id, "running bind automation");
            let result = self
                .cluster
                .runner
                .bind(&instance, &params, &self.cluster.config)
                .await;
            let handle = match &result {
                Ok(output) => output.handle.as_str(),
                Err(e) => e.handle(),
            };
            self.cluster
                .teardown(handle, self.cluster.namespace_for(&instance))
                .await;
            bind_creds = result?.credentials;
        } else {
            debug!(%binding_id, "launch_on_bind disabled, returning provision credentials");
        }

        instance.add_binding(binding_id);
        self.dao.set_service_instance(&instance)?;

        match (bind_creds, provision_creds) {
            (Some(creds), _) => {
                self.dao.set_extracted_credentials(&binding_id, &creds)?;
                Ok(BindOutcome::Created {
                    credentials: creds.credentials,
                })
            }
            (None, Some(creds)) => Ok(BindOutcome::Created {
                credentials: creds.credentials,
            }),
            (None, None) => Err(BrokerError::NoCredentials(instance_id)),
        }
    }

    pub async fn unbind(
        &self,
        instance_id: Uuid,
        binding_id: Uuid,
        req: UnbindRequest,
    ) -> BrokerResult<()> {
        if req.plan_id.is_empty() {
            return Err(BrokerError::Validation("plan_id is required to unbind".into()));
        }

        let provision_creds = self.optional_credentials(&instance_id)?;
        let bind_creds = self.optional_credentials(&binding_id)?;
        if provision_creds.is_none() && bind_creds.is_none() {
            warn!(%instance_id, %binding_id, "no credentials found, unbinding anyway");
        }

        let mut params = Parameters::new();
        if let Some(creds) = &provision_creds {
            params.insert(
                PROVISION_CREDENTIALS_KEY.into(),
                Value::Object(creds.credentials.clone()),
            );
        }
        if let Some(creds) = &bind_creds {
            params.insert(
                BIND_CREDENTIALS_KEY.into(),
                Value::Object(creds.credentials.clone()),
            );
        }

        let mut instance = self.get_instance(&instance_id)?;
        if let Some(provision_params) = &instance.parameters {
            params.insert(
                PROVISION_PARAMS_KEY.into(),
                Value::Object(provision_params.clone()),
            );
        }

        if self.config.launch_on_bind {
            info!(%instance_id, %binding_id, "running unbind automation");
            if let Err(e) = self
                .cluster
                .runner
                .unbind(&instance, &params, &self.cluster.config)
                .await
            {
                error!(%instance_id, %binding_id, error = %e, "unbind run failed");
                self.cluster
                    .teardown(e.handle(), self.cluster.namespace_for(&instance))
                    .await;
                return Err(e.into());
            }
        }

        if bind_creds.is_some() {
            self.dao.delete_extracted_credentials(&binding_id)?;
        }
        match self.dao.get_bind_instance(&binding_id) {
            Ok(binding) => self.dao.delete_binding(&binding, &mut instance)?,
            Err(e) if e.is_not_found() => {
                instance.remove_binding(&binding_id);
                self.dao.set_service_instance(&instance)?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(%instance_id, %binding_id, "binding removed");
        Ok(())
    }

    /// Report the state of an accepted operation.
    ///
    /// On a lookup failure the error carries the failed response, so a
    /// caller can still answer the platform.
    pub async fn last_operation(
        &self,
        instance_id: Uuid,
        req: &LastOperationRequest,
    ) -> BrokerResult<LastOperationResponse> {
        match self.dao.get_state(&instance_id, &req.operation) {
            Ok(job) => {
                debug!(%instance_id, operation = %req.operation, state = %job.state, "last operation");
                Ok(LastOperationResponse::from_state(job.state))
            }
            Err(source) => {
                error!(%instance_id, operation = %req.operation, error = %source, "could not read job state");
                Err(BrokerError::OperationLookup {
                    response: LastOperationResponse::failed(),
                    source,
                })
            }
        }
    }
}
