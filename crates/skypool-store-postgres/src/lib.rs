//! PostgreSQL implementation of the skypool state store.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `StateStore` trait from the skypool control plane.
//!
//! # Features
//!
//! - Status-scoped claim queries honoring the scheduler's in-flight set
//! - Compare-and-swap instance mutations (`claim` / `release` / `transition`)
//! - Idempotent default-pool upsert safe under concurrent submissions
//! - Soft deletes for runs and pools (rows are tombstoned, never dropped)
//! - Spec blobs (`run_spec`, `job_spec`, `job_provisioning_data`, `offer`)
//!   stored as JSONB and round-tripped exactly
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE runs (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     run_name TEXT NOT NULL,
//!     run_spec JSONB NOT NULL,
//!     submitted_at TIMESTAMPTZ NOT NULL,
//!     gateway_registered BOOLEAN NOT NULL DEFAULT FALSE,
//!     deleted BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! CREATE UNIQUE INDEX idx_runs_live_name ON runs (project, run_name)
//!     WHERE NOT deleted;
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     run_id UUID NOT NULL REFERENCES runs (id),
//!     run_name TEXT NOT NULL,
//!     job_num INTEGER NOT NULL,
//!     submission_num INTEGER NOT NULL,
//!     job_spec JSONB NOT NULL,
//!     status TEXT NOT NULL,
//!     error_code TEXT,
//!     job_provisioning_data JSONB,
//!     aborted BOOLEAN NOT NULL DEFAULT FALSE,
//!     submitted_at TIMESTAMPTZ NOT NULL,
//!     last_contact_at TIMESTAMPTZ,
//!     last_processed_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_jobs_claim ON jobs (status, submitted_at);
//!
//! CREATE TABLE pools (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     name TEXT NOT NULL,
//!     deleted BOOLEAN NOT NULL DEFAULT FALSE,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE UNIQUE INDEX idx_pools_live_name ON pools (project, name)
//!     WHERE NOT deleted;
//!
//! CREATE TABLE instances (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     pool_id UUID NOT NULL REFERENCES pools (id),
//!     name TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     offer JSONB NOT NULL,
//!     provisioning_data JSONB NOT NULL,
//!     termination_policy TEXT NOT NULL,
//!     termination_idle_secs BIGINT NOT NULL,
//!     backend TEXT NOT NULL,
//!     region TEXT NOT NULL,
//!     price DOUBLE PRECISION NOT NULL,
//!     job_id UUID,
//!     idle_since TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_instances_claim ON instances (status, created_at);
//! CREATE INDEX idx_instances_job ON instances (job_id) WHERE job_id IS NOT NULL;
//!
//! CREATE TABLE fleets (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     name TEXT NOT NULL,
//!     spec JSONB NOT NULL,
//!     status TEXT NOT NULL,
//!     status_message TEXT,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE gateways (
//!     id UUID PRIMARY KEY,
//!     project TEXT NOT NULL,
//!     name TEXT NOT NULL,
//!     backend TEXT NOT NULL,
//!     region TEXT NOT NULL,
//!     wildcard_domain TEXT,
//!     configuration JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use skypool_store_postgres::PgStateStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/skypool").await?;
//! let store = Arc::new(PgStateStore::new(pool));
//!
//! let scheduler = Scheduler::builder(store, backends) /* ... */ .build()?;
//! ```

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skypool::models::fleet::{FleetRecord, FleetSpec, FleetStatus};
use skypool::models::gateway::{GatewayConfiguration, GatewayRecord};
use skypool::models::pool::PoolRecord;
use skypool::store::{ReleaseOutcome, StateStore};
use skypool::{
    BackendType, InstanceRecord, InstanceStatus, JobErrorCode, JobRecord, JobStatus, RunRecord,
    TerminationPolicy,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL state store implementation.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const RUN_COLUMNS: &str =
    "id, project, run_name, run_spec, submitted_at, gateway_registered, deleted";
const JOB_COLUMNS: &str = "id, project, run_id, run_name, job_num, submission_num, job_spec, \
     status, error_code, job_provisioning_data, aborted, submitted_at, last_contact_at, \
     last_processed_at";
const INSTANCE_COLUMNS: &str = "id, project, pool_id, name, status, offer, provisioning_data, \
     termination_policy, termination_idle_secs, backend, region, price, job_id, idle_since, \
     created_at";

fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        run_name: row.try_get("run_name")?,
        spec: serde_json::from_value(row.try_get::<serde_json::Value, _>("run_spec")?)
            .context("corrupt run_spec blob")?,
        submitted_at: row.try_get("submitted_at")?,
        gateway_registered: row.try_get("gateway_registered")?,
        deleted: row.try_get("deleted")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    let error_code: Option<String> = row.try_get("error_code")?;
    let provisioning: Option<serde_json::Value> = row.try_get("job_provisioning_data")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        run_id: row.try_get("run_id")?,
        run_name: row.try_get("run_name")?,
        job_num: row.try_get::<i32, _>("job_num")? as u32,
        submission_num: row.try_get::<i32, _>("submission_num")? as u32,
        spec: serde_json::from_value(row.try_get::<serde_json::Value, _>("job_spec")?)
            .context("corrupt job_spec blob")?,
        status: JobStatus::from_str(&status)?,
        error_code: error_code
            .as_deref()
            .map(JobErrorCode::from_str)
            .transpose()?,
        provisioning_data: provisioning
            .map(serde_json::from_value)
            .transpose()
            .context("corrupt job_provisioning_data blob")?,
        aborted: row.try_get("aborted")?,
        submitted_at: row.try_get("submitted_at")?,
        last_contact_at: row.try_get("last_contact_at")?,
        last_processed_at: row.try_get("last_processed_at")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<InstanceRecord> {
    let status: String = row.try_get("status")?;
    let policy: String = row.try_get("termination_policy")?;
    let backend: String = row.try_get("backend")?;
    Ok(InstanceRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        pool_id: row.try_get("pool_id")?,
        name: row.try_get("name")?,
        status: InstanceStatus::from_str(&status)?,
        offer: serde_json::from_value(row.try_get::<serde_json::Value, _>("offer")?)
            .context("corrupt offer blob")?,
        provisioning_data: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("provisioning_data")?,
        )
        .context("corrupt provisioning_data blob")?,
        termination_policy: parse_termination_policy(&policy)?,
        termination_idle_time: Duration::from_secs(
            row.try_get::<i64, _>("termination_idle_secs")?.max(0) as u64,
        ),
        backend: BackendType::from_str(&backend)?,
        region: row.try_get("region")?,
        price: row.try_get("price")?,
        job_id: row.try_get("job_id")?,
        idle_since: row.try_get("idle_since")?,
        created_at: row.try_get("created_at")?,
    })
}

fn pool_from_row(row: &PgRow) -> Result<PoolRecord> {
    Ok(PoolRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        name: row.try_get("name")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_termination_policy(s: &str) -> Result<TerminationPolicy> {
    Ok(match s {
        "destroy-after-idle" => TerminationPolicy::DestroyAfterIdle,
        "dont-destroy" => TerminationPolicy::DontDestroy,
        other => anyhow::bail!("unknown termination policy: {other}"),
    })
}

fn termination_policy_str(policy: TerminationPolicy) -> &'static str {
    match policy {
        TerminationPolicy::DestroyAfterIdle => "destroy-after-idle",
        TerminationPolicy::DontDestroy => "dont-destroy",
    }
}

fn fleet_status_str(status: FleetStatus) -> &'static str {
    match status {
        FleetStatus::Submitted => "submitted",
        FleetStatus::Active => "active",
        FleetStatus::Failed => "failed",
    }
}

fn parse_fleet_status(s: &str) -> Result<FleetStatus> {
    Ok(match s {
        "submitted" => FleetStatus::Submitted,
        "active" => FleetStatus::Active,
        "failed" => FleetStatus::Failed,
        other => anyhow::bail!("unknown fleet status: {other}"),
    })
}

fn status_strings(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn instance_status_strings(statuses: &[InstanceStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, project, run_name, run_spec, submitted_at,
                              gateway_registered, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(&run.project)
        .bind(&run.run_name)
        .bind(serde_json::to_value(&run.spec)?)
        .bind(run.submitted_at)
        .bind(run.gateway_registered)
        .bind(run.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, project: &str, run_name: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE project = $1 AND run_name = $2 AND NOT deleted"
        ))
        .bind(project)
        .bind(run_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_run_by_id(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, project: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE project = $1 AND NOT deleted ORDER BY submitted_at DESC"
        ))
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn soft_delete_runs(&self, project: &str, run_names: &[String]) -> Result<()> {
        sqlx::query("UPDATE runs SET deleted = TRUE WHERE project = $1 AND run_name = ANY($2)")
            .bind(project)
            .bind(run_names)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_service_runs(&self, registered: bool) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE NOT deleted AND gateway_registered = $1 \
               AND run_spec->'configuration'->>'type' = 'service' \
             ORDER BY submitted_at"
        ))
        .bind(registered)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn set_gateway_registered(&self, run_id: Uuid, registered: bool) -> Result<()> {
        sqlx::query("UPDATE runs SET gateway_registered = $2 WHERE id = $1")
            .bind(run_id)
            .bind(registered)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, project, run_id, run_name, job_num, submission_num,
                              job_spec, status, error_code, job_provisioning_data,
                              aborted, submitted_at, last_contact_at, last_processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(&job.project)
        .bind(job.run_id)
        .bind(&job.run_name)
        .bind(job.job_num as i32)
        .bind(job.submission_num as i32)
        .bind(serde_json::to_value(&job.spec)?)
        .bind(job.status.as_str())
        .bind(job.error_code.map(|code| code.as_str()))
        .bind(
            job.provisioning_data
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(job.aborted)
        .bind(job.submitted_at)
        .bind(job.last_contact_at)
        .bind(job.last_processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_run_jobs(&self, run_id: Uuid) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = $1 ORDER BY job_num"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn next_job_in_statuses(
        &self,
        statuses: &[JobStatus],
        exclude: &[Uuid],
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = ANY($1) AND NOT (id = ANY($2)) \
             ORDER BY submitted_at, id \
             LIMIT 1"
        ))
        .bind(status_strings(statuses))
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET submission_num = $2,
                job_spec = $3,
                status = $4,
                error_code = $5,
                job_provisioning_data = $6,
                aborted = $7,
                last_contact_at = $8,
                last_processed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.submission_num as i32)
        .bind(serde_json::to_value(&job.spec)?)
        .bind(job.status.as_str())
        .bind(job.error_code.map(|code| code.as_str()))
        .bind(
            job.provisioning_data
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(job.aborted)
        .bind(job.last_contact_at)
        .bind(job.last_processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_instance(&self, instance: &InstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (id, project, pool_id, name, status, offer,
                                   provisioning_data, termination_policy,
                                   termination_idle_secs, backend, region, price,
                                   job_id, idle_since, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.project)
        .bind(instance.pool_id)
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(serde_json::to_value(&instance.offer)?)
        .bind(serde_json::to_value(&instance.provisioning_data)?)
        .bind(termination_policy_str(instance.termination_policy))
        .bind(instance.termination_idle_time.as_secs() as i64)
        .bind(instance.backend.as_str())
        .bind(&instance.region)
        .bind(instance.price)
        .bind(instance.job_id)
        .bind(instance.idle_since)
        .bind(instance.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn get_job_instance(&self, job_id: Uuid) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn list_pool_instances(&self, pool_id: Uuid) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE pool_id = $1 AND status <> 'terminated' ORDER BY name"
        ))
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn next_instance_in_statuses(
        &self,
        statuses: &[InstanceStatus],
        exclude: &[Uuid],
    ) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE status = ANY($1) AND NOT (id = ANY($2)) \
             ORDER BY created_at, id \
             LIMIT 1"
        ))
        .bind(instance_status_strings(statuses))
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn update_instance(&self, instance: &InstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE instances
            SET status = $2,
                provisioning_data = $3,
                termination_policy = $4,
                termination_idle_secs = $5,
                job_id = $6,
                idle_since = $7
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.status.as_str())
        .bind(serde_json::to_value(&instance.provisioning_data)?)
        .bind(termination_policy_str(instance.termination_policy))
        .bind(instance.termination_idle_time.as_secs() as i64)
        .bind(instance.job_id)
        .bind(instance.idle_since)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic `READY -> BUSY`: the WHERE clause is the compare, the UPDATE
    /// is the swap.
    async fn claim_instance(&self, instance_id: Uuid, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = 'busy', job_id = $2, idle_since = NULL
            WHERE id = $1 AND status = 'ready'
            "#,
        )
        .bind(instance_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_instance(
        &self,
        instance_id: Uuid,
        outcome: ReleaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match outcome {
            ReleaseOutcome::Reuse => {
                sqlx::query(
                    r#"
                    UPDATE instances
                    SET status = 'idle', job_id = NULL, idle_since = $2
                    WHERE id = $1 AND status = 'busy'
                    "#,
                )
                .bind(instance_id)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            ReleaseOutcome::Destroy => {
                sqlx::query(
                    r#"
                    UPDATE instances
                    SET status = 'terminating', job_id = NULL, idle_since = NULL
                    WHERE id = $1 AND status = 'busy'
                    "#,
                )
                .bind(instance_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn transition_instance(
        &self,
        instance_id: Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        anyhow::ensure!(
            from.can_transition_to(to),
            "illegal instance transition {from} -> {to}"
        );
        let result = sqlx::query("UPDATE instances SET status = $3 WHERE id = $1 AND status = $2")
            .bind(instance_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Idempotent upsert against the partial unique index on live pools,
    /// then a re-read, as concurrent submissions may race on first use.
    async fn ensure_pool(&self, project: &str, name: &str) -> Result<PoolRecord> {
        sqlx::query(
            r#"
            INSERT INTO pools (id, project, name, deleted, created_at)
            VALUES ($1, $2, $3, FALSE, $4)
            ON CONFLICT (project, name) WHERE NOT deleted DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project)
        .bind(name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_pool(project, name)
            .await?
            .context("pool vanished between upsert and re-read")
    }

    async fn get_pool(&self, project: &str, name: &str) -> Result<Option<PoolRecord>> {
        let row = sqlx::query(
            "SELECT id, project, name, deleted, created_at FROM pools \
             WHERE project = $1 AND name = $2 AND NOT deleted",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn list_pools(&self, project: &str) -> Result<Vec<PoolRecord>> {
        let rows = sqlx::query(
            "SELECT id, project, name, deleted, created_at FROM pools \
             WHERE project = $1 AND NOT deleted ORDER BY name",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pool_from_row).collect()
    }

    /// The emptiness check and the tombstone are one statement, so a
    /// concurrent instance creation cannot slip between them.
    async fn soft_delete_pool(&self, pool_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pools SET deleted = TRUE
            WHERE id = $1 AND NOT deleted
              AND NOT EXISTS (
                  SELECT 1 FROM instances
                  WHERE pool_id = $1 AND status <> 'terminated'
              )
            "#,
        )
        .bind(pool_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleets (id, project, name, spec, status, status_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(fleet.id)
        .bind(&fleet.project)
        .bind(&fleet.name)
        .bind(serde_json::to_value(&fleet.spec)?)
        .bind(fleet_status_str(fleet.status))
        .bind(&fleet.status_message)
        .bind(fleet.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fleet(&self, project: &str, name: &str) -> Result<Option<FleetRecord>> {
        let row = sqlx::query(
            "SELECT id, project, name, spec, status, status_message, created_at \
             FROM fleets WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let status: String = row.try_get("status")?;
            let spec: FleetSpec =
                serde_json::from_value(row.try_get::<serde_json::Value, _>("spec")?)
                    .context("corrupt fleet spec blob")?;
            Ok(FleetRecord {
                id: row.try_get("id")?,
                project: row.try_get("project")?,
                name: row.try_get("name")?,
                spec,
                status: parse_fleet_status(&status)?,
                status_message: row.try_get("status_message")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn update_fleet(&self, fleet: &FleetRecord) -> Result<()> {
        sqlx::query(
            "UPDATE fleets SET spec = $2, status = $3, status_message = $4 WHERE id = $1",
        )
        .bind(fleet.id)
        .bind(serde_json::to_value(&fleet.spec)?)
        .bind(fleet_status_str(fleet.status))
        .bind(&fleet.status_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_gateways(&self, project: &str) -> Result<Vec<GatewayRecord>> {
        let rows = sqlx::query(
            "SELECT id, project, name, backend, region, wildcard_domain, configuration, \
                    created_at \
             FROM gateways WHERE project = $1 ORDER BY name",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let backend: String = row.try_get("backend")?;
                let configuration: GatewayConfiguration =
                    serde_json::from_value(row.try_get::<serde_json::Value, _>("configuration")?)
                        .context("corrupt gateway configuration blob")?;
                Ok(GatewayRecord {
                    id: row.try_get("id")?,
                    project: row.try_get("project")?,
                    name: row.try_get("name")?,
                    backend: BackendType::from_str(&backend)?,
                    region: row.try_get("region")?,
                    wildcard_domain: row.try_get("wildcard_domain")?,
                    configuration,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
