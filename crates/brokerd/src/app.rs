//! Daemon assembly: opens the store, builds the cluster collaborators and
//! the work engine, and runs the startup and refresh tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use broker_core::BrokerdConfig;
use broker_engine::{Broker, DirectoryRegistry, RecoveryReport, Registry, start_engine};
use broker_runner::{Cluster, CommandRunner, DirSandbox};
use broker_state::{Dao, StateStore};

const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct App {
    pub broker: Arc<Broker>,
    config: BrokerdConfig,
}

impl App {
    pub async fn build(config: BrokerdConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.store.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = StateStore::open(&config.store.path)
            .with_context(|| format!("opening state store {}", config.store.path.display()))?;
        info!(path = %config.store.path.display(), "state store opened");
        let dao = Dao::new(store);

        std::fs::create_dir_all(&config.runner.work_dir)
            .with_context(|| format!("creating {}", config.runner.work_dir.display()))?;
        let sandbox = Arc::new(DirSandbox::new(&config.runner.work_dir));
        let runner = Arc::new(CommandRunner::new(&config.runner.program, sandbox.clone()));
        let cluster = Cluster::new(runner, sandbox, config.cluster.clone());

        let engine = start_engine(dao.clone(), cluster.clone(), config.engine.buffer_size).await?;
        info!(topics = ?engine.active_topics().await, "work engine started");

        let registries: Vec<Arc<dyn Registry>> = config
            .registries
            .iter()
            .map(|r| Arc::new(DirectoryRegistry::from_config(r)) as Arc<dyn Registry>)
            .collect();

        let broker = Broker::new(dao, cluster, engine, registries, config.broker.clone());
        Ok(Self {
            broker: Arc::new(broker),
            config,
        })
    }

    /// Startup tasks: recovery (never fatal) then the initial bootstrap.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.config.broker.recovery {
            match self.broker.recover().await {
                Ok(report) => info!(?report, "recovery complete"),
                Err(e) => error!(error = %e, "recovery failed"),
            }
        }

        if self.config.broker.bootstrap_on_startup {
            let response = self.broker.bootstrap().await?;
            info!(
                specs = response.spec_count,
                images = response.image_count,
                "initial bootstrap complete"
            );
        }
        Ok(())
    }

    /// One recovery pass that returns only once every job it restarted has
    /// finished, so the caller can exit without abandoning them.
    pub async fn recover_and_wait(&self) -> anyhow::Result<RecoveryReport> {
        let report = self.broker.recover().await?;
        if !report.restarted_jobs.is_empty() {
            info!(jobs = report.restarted_jobs.len(), "waiting for restarted jobs");
            self.broker
                .wait_for_jobs(&report.restarted_jobs, RESTART_POLL_INTERVAL)
                .await?;
            info!("restarted jobs finished");
        }
        Ok(report)
    }

    /// Reload the catalog on the configured interval until shutdown.
    pub async fn refresh_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(interval) = self.config.broker.refresh_interval() else {
            if self.config.broker.refresh_interval_is_valid() {
                info!("catalog refresh disabled");
            } else {
                warn!(
                    value = %self.config.broker.refresh_interval,
                    "refresh_interval is not a valid duration, catalog refresh disabled"
                );
            }
            let _ = shutdown.changed().await;
            return;
        };

        info!(interval_secs = interval.as_secs(), "catalog refresh started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.broker.bootstrap().await {
                        warn!(error = %e, "catalog refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("catalog refresh shutting down");
                    break;
                }
            }
        }
    }
}
