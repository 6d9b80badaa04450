//! `process_terminating_jobs`: graceful shutdown with a bounded grace
//! window, then forced instance termination.

use tracing::{info, warn};

use anyhow::Result;

use crate::models::job::{JobRecord, JobStatus};
use crate::scheduler::{snapshot, InFlightGuard, Scheduler};
use crate::store::{ReleaseOutcome, StateStore};

impl<S: StateStore> Scheduler<S> {
    /// One tick of the terminating-jobs loop: finish at most one job.
    pub async fn process_terminating_jobs(&self) -> Result<()> {
        let exclude = snapshot(&self.inflight.terminating);
        let Some(job) = self
            .store
            .next_job_in_statuses(&[JobStatus::Terminating], &exclude)
            .await?
        else {
            return Ok(());
        };
        let Some(_guard) = InFlightGuard::claim(&self.inflight.terminating, job.id) else {
            return Ok(());
        };
        self.finish_job(job).await
    }

    async fn finish_job(&self, mut job: JobRecord) -> Result<()> {
        if let Some(instance) = self.store.get_job_instance(job.id).await? {
            let data = instance.provisioning_data.clone();
            // A hard abort skips the pleasantries; so does a job whose
            // instance was already declared lost.
            let try_graceful =
                !job.aborted && job.error_code.is_none() && job.provisioning_data.is_some();
            let stopped = if try_graceful {
                matches!(
                    tokio::time::timeout(self.config.stop_grace, self.agent.stop_job(&data)).await,
                    Ok(Ok(()))
                )
            } else {
                false
            };

            if stopped {
                // The host is healthy, just no longer ours: park it.
                info!(job = %job.spec.job_name, instance = %instance.name, "stopped gracefully");
                self.release_job_instance(&job, ReleaseOutcome::Reuse).await?;
            } else {
                if try_graceful {
                    warn!(
                        job = %job.spec.job_name,
                        instance = %instance.name,
                        "graceful stop failed within grace window; destroying instance"
                    );
                }
                self.release_job_instance(&job, ReleaseOutcome::Destroy)
                    .await?;
                if let Some(instance) = self.store.get_instance(instance.id).await? {
                    self.terminate_instance_vm(&instance).await?;
                }
            }
        }

        let terminal = if job.aborted {
            JobStatus::Aborted
        } else {
            JobStatus::Terminated
        };
        let code = job.error_code;
        info!(job = %job.spec.job_name, status = %terminal, "job finished");
        self.transition_job(&mut job, terminal, code).await
    }
}
