//! Provision and deprovision jobs.
//!
//! A job drives one automation run through the cluster runner, tears down
//! the run's sandbox whatever the outcome, and posts one [`WorkMsg`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info};

use broker_core::ServiceInstance;
use broker_runner::Cluster;

use crate::engine::{Job, WorkMsg, post};

pub struct ProvisionJob {
    instance: ServiceInstance,
    cluster: Cluster,
}

impl ProvisionJob {
    pub fn new(instance: ServiceInstance, cluster: Cluster) -> Self {
        Self { instance, cluster }
    }
}

#[async_trait]
impl Job for ProvisionJob {
    async fn run(&self, token: &str, sender: mpsc::Sender<WorkMsg>) {
        let namespace = self.cluster.namespace_for(&self.instance);
        let mut msg = WorkMsg::new(self.instance.id, token, self.instance.spec_id());

        match self
            .cluster
            .runner
            .provision(&self.instance, &self.cluster.config)
            .await
        {
            Ok(output) => {
                self.cluster.teardown(&output.handle, namespace).await;
                match serde_json::to_string(&output.credentials) {
                    Ok(encoded) => msg.msg = encoded,
                    Err(e) => msg.error = format!("failed to encode credentials: {e}"),
                }
                info!(instance_id = %self.instance.id, %token, handle = %output.handle, "provision run finished");
                msg.podname = output.handle;
            }
            Err(e) => {
                error!(instance_id = %self.instance.id, %token, error = %e, "provision run failed");
                self.cluster.teardown(e.handle(), namespace).await;
                msg.podname = e.handle().to_string();
                msg.error = e.to_string();
            }
        }

        post(&sender, msg).await;
    }
}

/// Runs the deprovision action only. Removing the instance's records is
/// left to the subscriber that receives the completion message.
pub struct DeprovisionJob {
    instance: ServiceInstance,
    cluster: Cluster,
}

impl DeprovisionJob {
    pub fn new(instance: ServiceInstance, cluster: Cluster) -> Self {
        Self { instance, cluster }
    }
}

#[async_trait]
impl Job for DeprovisionJob {
    async fn run(&self, token: &str, sender: mpsc::Sender<WorkMsg>) {
        let mut msg = WorkMsg::new(self.instance.id, token, self.instance.spec_id());

        match self
            .cluster
            .runner
            .deprovision(&self.instance, &self.cluster.config)
            .await
        {
            Ok(handle) => {
                info!(instance_id = %self.instance.id, %token, %handle, "deprovision run finished");
                msg.podname = handle;
            }
            Err(e) => {
                error!(instance_id = %self.instance.id, %token, error = %e, "deprovision run failed");
                let namespace = self.cluster.namespace_for(&self.instance);
                self.cluster.teardown(e.handle(), namespace).await;
                msg.podname = e.handle().to_string();
                msg.error = e.to_string();
            }
        }

        post(&sender, msg).await;
    }
}
