//! Work engine: runs long jobs in the background and routes their
//! completion messages to one subscriber per topic.
//!
//! Each topic owns a bounded channel. Attaching a subscriber spawns the
//! task that drains it; starting a job spawns the job with a clone of the
//! topic's sender. A job posts exactly one message when it finishes, and
//! the subscriber turns that message into persisted state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{BrokerResult, EngineError, EngineResult};

pub const PROVISION_TOPIC: &str = "provision_topic";
pub const DEPROVISION_TOPIC: &str = "deprovision_topic";

/// Completion message posted by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMsg {
    pub instance_uuid: Uuid,
    pub job_token: String,
    #[serde(default)]
    pub spec_id: String,
    /// Workload handle of the run, possibly partial on failure.
    #[serde(default)]
    pub podname: String,
    /// Success payload: JSON-encoded credentials. Empty means "still running".
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub error: String,
}

impl WorkMsg {
    pub fn new(instance_uuid: Uuid, job_token: &str, spec_id: &str) -> Self {
        Self {
            instance_uuid,
            job_token: job_token.to_string(),
            spec_id: spec_id.to_string(),
            podname: String::new(),
            msg: String::new(),
            error: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// JSON form of the message, used when logging it.
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A unit of background work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Run to completion and post exactly one message on `sender`.
    async fn run(&self, token: &str, sender: mpsc::Sender<WorkMsg>);
}

/// Consumes the messages of one topic.
#[async_trait]
pub trait WorkSubscriber: Send + Sync + 'static {
    async fn handle(&self, msg: WorkMsg) -> BrokerResult<()>;
}

/// Topic-routed background job runner.
pub struct WorkEngine {
    buffer_size: usize,
    topics: RwLock<HashMap<String, mpsc::Sender<WorkMsg>>>,
}

impl WorkEngine {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `subscriber` to `topic` and start draining it.
    ///
    /// A failed message is logged and the loop moves on to the next one.
    pub async fn attach_subscriber(
        &self,
        subscriber: Arc<dyn WorkSubscriber>,
        topic: &str,
    ) -> EngineResult<()> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(topic) {
            return Err(EngineError::SubscriberExists(topic.to_string()));
        }

        let (tx, mut rx) = mpsc::channel::<WorkMsg>(self.buffer_size);
        topics.insert(topic.to_string(), tx);

        let topic = topic.to_string();
        tokio::spawn(async move {
            info!(%topic, "subscriber listening");
            while let Some(msg) = rx.recv().await {
                debug!(%topic, msg = %msg.render(), "work message received");
                let instance_id = msg.instance_uuid;
                let token = msg.job_token.clone();
                if let Err(e) = subscriber.handle(msg).await {
                    error!(
                        %topic,
                        %instance_id,
                        %token,
                        error = %e,
                        "failed to process work message"
                    );
                }
            }
            debug!(%topic, "work queue closed");
        });

        Ok(())
    }

    /// Start `job` on `topic` and return its token.
    ///
    /// An empty `token` gets a fresh one; recovery passes the original
    /// token so the restarted job writes the same state record.
    pub async fn start_new_job(
        &self,
        token: &str,
        job: impl Job,
        topic: &str,
    ) -> EngineResult<String> {
        let sender = self
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| EngineError::NoSubscriber(topic.to_string()))?;

        let token = if token.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            token.to_string()
        };

        debug!(%topic, %token, "starting job");
        let job_token = token.clone();
        tokio::spawn(async move {
            job.run(&job_token, sender).await;
        });

        Ok(token)
    }

    pub async fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Post a job's completion message. A closed queue is logged; the job has
/// nowhere else to report.
pub(crate) async fn post(sender: &mpsc::Sender<WorkMsg>, msg: WorkMsg) {
    let instance_id = msg.instance_uuid;
    if sender.send(msg).await.is_err() {
        error!(%instance_id, "work queue closed, completion message dropped");
    }
}
