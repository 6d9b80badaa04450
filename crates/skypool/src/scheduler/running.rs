//! `process_running_jobs`: drive provisioned jobs through `PULLING` and
//! `RUNNING` by polling the on-host agent, and reconcile hosts the agent
//! cannot reach against the backend's view of the launch request.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use anyhow::Result;

use crate::agent::AgentJobStatus;
use crate::backend::RequestStatus;
use crate::models::instance::{InstanceStatus, JobProvisioningData};
use crate::models::job::{JobErrorCode, JobRecord, JobStatus};
use crate::retry::{no_capacity_outcome, retry_active};
use crate::scheduler::{snapshot, InFlightGuard, Scheduler};
use crate::store::{ReleaseOutcome, StateStore};

impl<S: StateStore> Scheduler<S> {
    /// One tick of the running-jobs loop: poll at most one job in
    /// `PROVISIONING`, `PULLING`, or `RUNNING`.
    pub async fn process_running_jobs(&self) -> Result<()> {
        let exclude = snapshot(&self.inflight.running);
        let statuses = [
            JobStatus::Provisioning,
            JobStatus::Pulling,
            JobStatus::Running,
        ];
        let Some(job) = self.store.next_job_in_statuses(&statuses, &exclude).await? else {
            return Ok(());
        };
        let Some(_guard) = InFlightGuard::claim(&self.inflight.running, job.id) else {
            return Ok(());
        };
        self.poll_job(job).await
    }

    async fn poll_job(&self, mut job: JobRecord) -> Result<()> {
        let Some(data) = job.provisioning_data.clone() else {
            // Jobs past SUBMITTED always carry provisioning data.
            error!(job_id = %job.id, status = %job.status, "job without provisioning data; failing");
            return self.transition_job(&mut job, JobStatus::Failed, None).await;
        };
        let now = Utc::now();
        match job.status {
            JobStatus::Provisioning => {
                let probe = tokio::time::timeout(
                    self.config.agent_timeout,
                    self.agent.healthcheck(&data),
                )
                .await;
                match probe {
                    Ok(Ok(())) => {
                        job.last_contact_at = Some(now);
                        info!(job = %job.spec.job_name, "agent reachable, pulling");
                        self.transition_job(&mut job, JobStatus::Pulling, None).await
                    }
                    _ => self.reconcile_unreachable(job, &data, now).await,
                }
            }
            JobStatus::Pulling | JobStatus::Running => {
                let status = tokio::time::timeout(
                    self.config.agent_timeout,
                    self.agent.job_status(&data),
                )
                .await;
                match status {
                    Ok(Ok(agent_status)) => {
                        job.last_contact_at = Some(now);
                        self.apply_agent_status(job, agent_status).await
                    }
                    _ => self.reconcile_unreachable(job, &data, now).await,
                }
            }
            _ => Ok(()),
        }
    }

    async fn apply_agent_status(
        &self,
        mut job: JobRecord,
        agent_status: AgentJobStatus,
    ) -> Result<()> {
        match (job.status, agent_status) {
            (JobStatus::Pulling, AgentJobStatus::Running | AgentJobStatus::Done) => {
                // A container that already exited is observed as RUNNING for
                // one tick; the next poll settles it.
                info!(job = %job.spec.job_name, "container running");
                self.transition_job(&mut job, JobStatus::Running, None).await
            }
            (JobStatus::Running, AgentJobStatus::Done) => {
                info!(job = %job.spec.job_name, "container exited cleanly");
                self.release_job_instance(&job, ReleaseOutcome::Reuse).await?;
                self.transition_job(&mut job, JobStatus::Done, None).await
            }
            (_, AgentJobStatus::Exited(code)) => {
                warn!(job = %job.spec.job_name, code, "container exited with error");
                self.release_job_instance(&job, ReleaseOutcome::Reuse).await?;
                self.transition_job(
                    &mut job,
                    JobStatus::Failed,
                    Some(JobErrorCode::ContainerExitedWithError),
                )
                .await
            }
            _ => {
                // Still pulling / still running: persist the heartbeat.
                self.commit_job(&mut job).await
            }
        }
    }

    /// The agent did not answer. Ask the backend about the launch request
    /// before blaming the network, then apply the grace window.
    async fn reconcile_unreachable(
        &self,
        mut job: JobRecord,
        data: &JobProvisioningData,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let head = match self.backends.get(data.backend) {
            Some(adapter) => tokio::time::timeout(
                self.config.agent_timeout,
                adapter.get_request_head(data),
            )
            .await
            .ok()
            .and_then(|result| result.ok()),
            None => None,
        };

        match head {
            Some(RequestStatus::NoCapacity) => {
                // Spot interruption: identical policy to a failed provision
                // attempt.
                let Some(run) = self.store.get_run_by_id(job.run_id).await? else {
                    return self.transition_job(&mut job, JobStatus::Failed, None).await;
                };
                self.mark_job_instance_lost(&job).await?;
                let (status, code) = no_capacity_outcome(
                    &run.spec.profile,
                    run.submitted_at,
                    now,
                    JobErrorCode::InterruptedByNoCapacity,
                );
                warn!(job = %job.spec.job_name, next = %status, "capacity lost");
                self.transition_job(&mut job, status, code).await
            }
            Some(RequestStatus::Terminated) => {
                self.mark_job_instance_lost(&job).await?;
                let retry = if job.status == JobStatus::Provisioning {
                    match self.store.get_run_by_id(job.run_id).await? {
                        Some(run) => retry_active(&run.spec.profile, run.submitted_at, now),
                        None => false,
                    }
                } else {
                    false
                };
                if retry {
                    warn!(job = %job.spec.job_name, "instance terminated mid-provision, retrying");
                    self.transition_job(&mut job, JobStatus::Pending, None).await
                } else {
                    warn!(job = %job.spec.job_name, "instance terminated");
                    self.transition_job(
                        &mut job,
                        JobStatus::Failed,
                        Some(JobErrorCode::InstanceTerminated),
                    )
                    .await
                }
            }
            _ => {
                // Backend says the host should be there (or had no answer):
                // only give up once the grace window lapses.
                let last_contact = job.last_contact_at.unwrap_or(job.submitted_at);
                let grace = chrono::Duration::from_std(self.config.unreachable_grace)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600));
                if now - last_contact >= grace {
                    warn!(
                        job = %job.spec.job_name,
                        since = %last_contact,
                        "agent unreachable beyond grace window; terminating"
                    );
                    self.transition_job(
                        &mut job,
                        JobStatus::Terminating,
                        Some(JobErrorCode::InstanceTerminated),
                    )
                    .await
                } else {
                    self.commit_job(&mut job).await
                }
            }
        }
    }

    /// Let go of the instance backing a job, if any.
    pub(crate) async fn release_job_instance(
        &self,
        job: &JobRecord,
        outcome: ReleaseOutcome,
    ) -> Result<()> {
        if let Some(instance) = self.store.get_job_instance(job.id).await? {
            let released = self
                .store
                .release_instance(instance.id, outcome, Utc::now())
                .await?;
            if !released {
                warn!(
                    instance = %instance.name,
                    status = %instance.status,
                    "release skipped: instance was not busy"
                );
            }
        }
        Ok(())
    }

    /// The VM behind a job is gone (spot reclaim, external terminate).
    /// Record that without calling the backend: there is nothing left to
    /// terminate.
    pub(crate) async fn mark_job_instance_lost(&self, job: &JobRecord) -> Result<()> {
        if let Some(mut instance) = self.store.get_job_instance(job.id).await? {
            instance.status = InstanceStatus::Terminated;
            instance.job_id = None;
            instance.idle_since = None;
            self.store.update_instance(&instance).await?;
            info!(instance = %instance.name, "instance recorded as lost");
        }
        Ok(())
    }
}
