//! Startup recovery of jobs a previous process left in progress.
//!
//! For every in-progress job state:
//! - an instance record that is missing, undecodable or incomplete marks the
//!   job failed (and the broken record is removed), except for a deprovision
//!   job whose instance is gone, which had finished its cleanup;
//! - a job that never reported a workload handle is restarted under its
//!   original token;
//! - a job with a handle is queried, and finished runs are completed with
//!   the credentials they left behind.
//!
//! A failed runner query aborts the pass.

use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use broker_core::{JobMethod, JobState, RecoverStatus, State};
use broker_state::StateError;

use crate::broker::Broker;
use crate::error::BrokerResult;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restarted: usize,
    /// `(instance, token)` of every restarted job.
    pub restarted_jobs: Vec<(Uuid, String)>,
    pub completed: usize,
    pub failed: usize,
    /// Runs that are still going; left for their own completion.
    pub pending: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

impl Broker {
    pub async fn recover(&self) -> BrokerResult<RecoveryReport> {
        let statuses = self.dao.find_job_states_by_state(State::InProgress)?;
        let mut report = RecoveryReport::default();
        if statuses.is_empty() {
            info!("no jobs to recover");
            return Ok(report);
        }

        info!(jobs = statuses.len(), "recovering in-progress jobs");
        for status in statuses {
            self.recover_one(&status, &mut report).await?;
        }

        info!(
            restarted = report.restarted,
            completed = report.completed,
            failed = report.failed,
            pending = report.pending,
            "recovery finished"
        );
        Ok(report)
    }

    async fn recover_one(
        &self,
        status: &RecoverStatus,
        report: &mut RecoveryReport,
    ) -> BrokerResult<()> {
        let id = status.instance_id;
        let job = &status.state;

        let instance = match self.dao.get_service_instance(&id) {
            Ok(instance) if !instance.is_incomplete() => instance,
            Ok(_) | Err(StateError::Deserialize(_)) => {
                warn!(instance_id = %id, token = %job.token, "instance record is incomplete, failing its job");
                self.fail_job(&id, job)?;
                self.dao.delete_service_instance(&id)?;
                report.failed += 1;
                return Ok(());
            }
            Err(e) if e.is_not_found() && job.method == JobMethod::Deprovision => {
                info!(instance_id = %id, token = %job.token, "instance already removed, deprovision complete");
                self.dao.set_state(
                    &id,
                    &JobState {
                        state: State::Succeeded,
                        ..job.clone()
                    },
                )?;
                report.completed += 1;
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                warn!(instance_id = %id, token = %job.token, "instance record is gone, failing its job");
                self.fail_job(&id, job)?;
                report.failed += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if job.podname.is_empty() {
            info!(instance_id = %id, token = %job.token, method = ?job.method, "restarting job");
            self.restart_job(&instance, job.method, &job.token).await?;
            report.restarted += 1;
            report.restarted_jobs.push((id, job.token.clone()));
            return Ok(());
        }

        if job.method == JobMethod::Deprovision {
            warn!(instance_id = %id, podname = %job.podname, "deprovision run still outstanding");
            report.pending += 1;
            return Ok(());
        }

        let namespace = self.cluster.namespace_for(&instance);
        let credentials = self
            .cluster
            .runner
            .extract_credentials(&job.podname, namespace)
            .await
            .inspect_err(|e| {
                error!(instance_id = %id, podname = %job.podname, error = %e, "could not query run")
            })?;

        match credentials {
            Some(creds) => {
                self.dao.set_extracted_credentials(&id, &creds)?;
                self.dao.set_state(
                    &id,
                    &JobState::new(&job.token, State::Succeeded)
                        .with_podname(&job.podname)
                        .with_method(job.method),
                )?;
                info!(instance_id = %id, token = %job.token, "run finished, job completed");
                report.completed += 1;
            }
            None => {
                info!(instance_id = %id, podname = %job.podname, "run still in progress");
                report.pending += 1;
            }
        }
        Ok(())
    }

    /// Poll the given jobs until none of them is in progress.
    pub async fn wait_for_jobs(
        &self,
        jobs: &[(Uuid, String)],
        poll_interval: Duration,
    ) -> BrokerResult<()> {
        let mut outstanding: Vec<&(Uuid, String)> = jobs.iter().collect();
        while !outstanding.is_empty() {
            let mut still_running = Vec::with_capacity(outstanding.len());
            for job in outstanding {
                let (id, token) = job;
                let state = self.dao.get_state(id, token)?;
                if state.state.is_terminal() {
                    debug!(instance_id = %id, %token, state = %state.state, "job finished");
                } else {
                    still_running.push(job);
                }
            }
            outstanding = still_running;
            if !outstanding.is_empty() {
                tokio::time::sleep(poll_interval).await;
            }
        }
        Ok(())
    }

    fn fail_job(&self, id: &Uuid, job: &JobState) -> BrokerResult<()> {
        let failed = JobState {
            state: State::Failed,
            ..job.clone()
        };
        self.dao.set_state(id, &failed)?;
        Ok(())
    }
}
