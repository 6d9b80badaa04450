//! `process_submitted_jobs`: the scheduling decision.
//!
//! A claimed `SUBMITTED` job is matched against the pool first; only when
//! reuse is impossible (and the creation policy allows it) does the
//! provisioner spend money. The same loop revisits `PENDING` jobs and
//! resubmits them while their retry window holds.

use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use anyhow::Result;

use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::models::job::{JobErrorCode, JobRecord, JobStatus};
use crate::models::profile::CreationPolicy;
use crate::pool;
use crate::provision::{provision_job, ProvisionTimeouts, Provisioned};
use crate::retry::{no_capacity_outcome, retry_active};
use crate::scheduler::{snapshot, InFlightGuard, Scheduler};
use crate::store::StateStore;

impl<S: StateStore> Scheduler<S> {
    /// One tick of the submitted-jobs loop: schedule at most one submitted
    /// job, or failing that, revisit at most one pending job.
    ///
    /// Sibling-blocked jobs are skipped within the tick rather than ending
    /// it, so a waiting job at the head of the queue cannot starve the jobs
    /// behind it.
    pub async fn process_submitted_jobs(&self) -> Result<()> {
        let mut exclude = snapshot(&self.inflight.submitted);
        while let Some(job) = self
            .store
            .next_job_in_statuses(&[JobStatus::Submitted], &exclude)
            .await?
        {
            exclude.push(job.id);
            let Some(_guard) = InFlightGuard::claim(&self.inflight.submitted, job.id) else {
                continue;
            };
            if self.sibling_blocked(&job).await? {
                debug!(job = %job.spec.job_name, "waiting for earlier siblings");
                continue;
            }
            return self.schedule_submitted_job(job).await;
        }
        if let Some(job) = self
            .store
            .next_job_in_statuses(&[JobStatus::Pending], &exclude)
            .await?
        {
            let Some(_guard) = InFlightGuard::claim(&self.inflight.submitted, job.id) else {
                return Ok(());
            };
            return self.revisit_pending_job(job).await;
        }
        Ok(())
    }

    /// Intra-run serialization: a later job waits until every earlier
    /// sibling has at least reached PROVISIONING, so a run is never half
    /// scheduled.
    async fn sibling_blocked(&self, job: &JobRecord) -> Result<bool> {
        if job.job_num == 0 {
            return Ok(false);
        }
        let siblings = self.store.list_run_jobs(job.run_id).await?;
        Ok(siblings.iter().any(|sibling| {
            sibling.job_num < job.job_num
                && matches!(sibling.status, JobStatus::Submitted | JobStatus::Pending)
        }))
    }

    async fn schedule_submitted_job(&self, mut job: JobRecord) -> Result<()> {
        debug!(job = %job.spec.job_name, "scheduling submitted job");
        let Some(run) = self.store.get_run_by_id(job.run_id).await? else {
            error!(job_id = %job.id, "submitted job has no run; failing");
            return self.transition_job(&mut job, JobStatus::Failed, None).await;
        };

        let Some(project) = self.projects.get_project(&run.project).await? else {
            error!(project = %run.project, job_id = %job.id, "project config missing; failing job");
            return self.transition_job(&mut job, JobStatus::Failed, None).await;
        };

        let profile = &run.spec.profile;
        let pool_name = job
            .spec
            .pool_name
            .clone()
            .unwrap_or_else(|| profile.pool_name().to_string());
        let pool = self.store.ensure_pool(&run.project, &pool_name).await?;

        // Reuse before provisioning. Candidates are walked best-first and
        // claimed by CAS; losing every race is the same as having none.
        let instances = self.store.list_pool_instances(pool.id).await?;
        let candidates = pool::filter_instances(
            &instances,
            profile,
            &job.spec.requirements,
            InstanceStatus::Ready,
        );
        debug!(job = %job.spec.job_name, candidates = candidates.len(), "pool candidates");
        for candidate in pool::rank_candidates(&candidates) {
            if pool::claim(self.store.as_ref(), candidate, job.id).await? {
                job.provisioning_data = Some(candidate.provisioning_data.clone());
                job.last_contact_at = Some(Utc::now());
                info!(job = %job.spec.job_name, instance = %candidate.name, "reusing pool instance");
                return self
                    .transition_job(&mut job, JobStatus::Provisioning, None)
                    .await;
            }
        }

        if profile.creation_policy == CreationPolicy::Reuse {
            info!(job = %job.spec.job_name, "no reusable instance and creation policy is reuse");
            return self
                .transition_job(
                    &mut job,
                    JobStatus::Failed,
                    Some(JobErrorCode::FailedToStartDueToNoCapacity),
                )
                .await;
        }

        let timeouts = ProvisionTimeouts {
            offer_query: self.config.offer_query_timeout,
            launch: self.config.launch_timeout,
        };
        match provision_job(
            &self.backends,
            &project.backends,
            &run.spec,
            &job.spec,
            &project.ssh_keys,
            pool.id,
            timeouts,
        )
        .await
        {
            Ok(Some(provisioned)) => {
                // Persist the instance before touching the job: a crash
                // between here and the job commit leaves a record that is
                // recoverable by backend instance id.
                let instance =
                    self.new_busy_instance(&run.project, &job, profile, pool.id, &provisioned);
                self.store.create_instance(&instance).await?;
                job.provisioning_data = Some(provisioned.data);
                info!(
                    job = %job.spec.job_name,
                    backend = %provisioned.offer.backend,
                    region = %provisioned.offer.region,
                    price = provisioned.offer.price,
                    "provisioned fresh instance"
                );
                self.transition_job(&mut job, JobStatus::Provisioning, None)
                    .await
            }
            Ok(None) => {
                let (status, code) = no_capacity_outcome(
                    profile,
                    run.submitted_at,
                    Utc::now(),
                    JobErrorCode::FailedToStartDueToNoCapacity,
                );
                info!(job = %job.spec.job_name, next = %status, "all offers exhausted");
                self.transition_job(&mut job, status, code).await
            }
            Err(err) => {
                error!(job = %job.spec.job_name, error = %err, "fatal backend error; not retrying");
                self.transition_job(
                    &mut job,
                    JobStatus::Failed,
                    Some(JobErrorCode::FailedToStartDueToBackendError),
                )
                .await
            }
        }
    }

    async fn revisit_pending_job(&self, mut job: JobRecord) -> Result<()> {
        let Some(run) = self.store.get_run_by_id(job.run_id).await? else {
            error!(job_id = %job.id, "pending job has no run; failing");
            return self.transition_job(&mut job, JobStatus::Failed, None).await;
        };
        if retry_active(&run.spec.profile, run.submitted_at, Utc::now()) {
            job.resubmit(Utc::now());
            debug!(
                job = %job.spec.job_name,
                submission = job.submission_num,
                "retry window open, resubmitting"
            );
            self.commit_job(&mut job).await
        } else {
            info!(job = %job.spec.job_name, "retry window elapsed, failing");
            self.transition_job(
                &mut job,
                JobStatus::Failed,
                Some(JobErrorCode::FailedToStartDueToNoCapacity),
            )
            .await
        }
    }

    fn new_busy_instance(
        &self,
        project: &str,
        job: &JobRecord,
        profile: &crate::models::profile::Profile,
        pool_id: Uuid,
        provisioned: &Provisioned,
    ) -> InstanceRecord {
        InstanceRecord {
            id: Uuid::new_v4(),
            project: project.to_string(),
            pool_id,
            name: job.spec.job_name.clone(),
            status: InstanceStatus::Busy,
            offer: provisioned.offer.clone(),
            provisioning_data: provisioned.data.clone(),
            termination_policy: profile.termination_policy,
            termination_idle_time: profile.termination_idle_time(),
            backend: provisioned.offer.backend,
            region: provisioned.offer.region.clone(),
            price: provisioned.offer.price,
            job_id: Some(job.id),
            idle_since: None,
            created_at: Utc::now(),
        }
    }
}
