//! The relational persistence surface.
//!
//! The database is the single source of truth; everything in memory
//! (in-flight sets, caches) is advisory. Implementations must make the
//! claim queries and the instance CAS atomic — on PostgreSQL that is
//! `FOR UPDATE SKIP LOCKED` and a conditional `UPDATE`; the in-memory test
//! store holds one mutex across each call.
//!
//! # Implementer notes
//!
//! - `next_*_in_statuses` must honor the `exclude` list: the scheduler
//!   passes the ids it is currently processing so one entity is never
//!   claimed twice within a tick.
//! - `claim_instance` / `transition_instance` / `release_instance` are
//!   compare-and-swap: they return `false` (not an error) when the observed
//!   status lost the race.
//! - `update_job` is a plain row write; the caller must hold the loop's
//!   in-flight claim for that job.
//! - Runs and pools are soft-deleted. A deleted row keeps its primary key
//!   but stops matching every lookup here.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::fleet::FleetRecord;
use crate::models::gateway::GatewayRecord;
use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::models::job::{JobRecord, JobStatus};
use crate::models::pool::PoolRecord;
use crate::models::run::RunRecord;

/// What to do with a `BUSY` instance once its job lets go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The host is healthy: park it as `IDLE` for reuse.
    Reuse,
    /// The host is suspect or the VM is gone: move to `TERMINATING`.
    Destroy,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // --- Runs ---

    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    /// The non-deleted run with this name, if any.
    async fn get_run(&self, project: &str, run_name: &str) -> Result<Option<RunRecord>>;

    async fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Non-deleted runs of a project.
    async fn list_runs(&self, project: &str) -> Result<Vec<RunRecord>>;

    /// Tombstone runs by name. Missing names are ignored.
    async fn soft_delete_runs(&self, project: &str, run_names: &[String]) -> Result<()>;

    /// Non-deleted `service`-type runs filtered by gateway registration
    /// state, across all projects.
    async fn list_service_runs(&self, registered: bool) -> Result<Vec<RunRecord>>;

    async fn set_gateway_registered(&self, run_id: Uuid, registered: bool) -> Result<()>;

    // --- Jobs ---

    async fn create_job(&self, job: &JobRecord) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>>;

    /// Jobs of a run ordered by `job_num`.
    async fn list_run_jobs(&self, run_id: Uuid) -> Result<Vec<JobRecord>>;

    /// Oldest job in any of the statuses, skipping `exclude`. The scheduler's
    /// claim query.
    async fn next_job_in_statuses(
        &self,
        statuses: &[JobStatus],
        exclude: &[Uuid],
    ) -> Result<Option<JobRecord>>;

    /// Full-row write. Caller must hold the in-flight claim for the job.
    async fn update_job(&self, job: &JobRecord) -> Result<()>;

    // --- Instances ---

    async fn create_instance(&self, instance: &InstanceRecord) -> Result<()>;

    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<InstanceRecord>>;

    /// The instance currently back-referencing this job, if any.
    async fn get_job_instance(&self, job_id: Uuid) -> Result<Option<InstanceRecord>>;

    /// Non-terminated instances of a pool.
    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<InstanceRecord>>;

    /// Oldest instance in any of the statuses, skipping `exclude`.
    async fn next_instance_in_statuses(
        &self,
        statuses: &[InstanceStatus],
        exclude: &[Uuid],
    ) -> Result<Option<InstanceRecord>>;

    /// Full-row write. Caller must hold the in-flight claim or the CAS
    /// ticket for the instance.
    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()>;

    /// CAS `READY -> BUSY`, setting the job back-reference. Returns `false`
    /// when the observed status was not `READY`.
    async fn claim_instance(&self, instance_id: Uuid, job_id: Uuid) -> Result<bool>;

    /// CAS `BUSY -> IDLE` (reuse, stamping `idle_since = now`) or
    /// `BUSY -> TERMINATING` (destroy). Clears the job back-reference.
    /// Returns `false` when the observed status was not `BUSY`.
    async fn release_instance(
        &self,
        instance_id: Uuid,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// CAS `from -> to`. Returns `false` when the observed status was not
    /// `from`; errors when the edge is illegal.
    async fn transition_instance(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool>;

    // --- Pools ---

    /// Idempotent upsert of `(project, name)`, then a re-read. Safe to call
    /// from concurrent submissions.
    async fn ensure_pool(&self, project: &str, name: &str) -> Result<PoolRecord>;

    async fn get_pool(&self, project: &str, name: &str) -> Result<Option<PoolRecord>>;

    async fn list_pools(&self, project: &str) -> Result<Vec<PoolRecord>>;

    /// Tombstone the pool unless it still has non-terminated instances.
    /// Returns `false` when rejected.
    async fn soft_delete_pool(&self, pool_id: Uuid) -> Result<bool>;

    // --- Fleets ---

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<()>;

    async fn get_fleet(&self, project: &str, name: &str) -> Result<Option<FleetRecord>>;

    async fn update_fleet(&self, fleet: &FleetRecord) -> Result<()>;

    // --- Gateways ---

    async fn list_gateways(&self, project: &str) -> Result<Vec<GatewayRecord>>;
}
