//! Run submission and lifecycle commands.
//!
//! Runs are created here and mutated only by the control loops afterwards.
//! Stopping is a status write (`TERMINATING` plus the abort flag); the
//! terminating loop does the actual work on its next tick.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::ClientError;
use crate::models::job::{GatewayHint, JobRecord, JobSpec, JobStatus};
use crate::models::run::{
    run_cost, run_status, service_info, Run, RunConfiguration, RunRecord, RunSpec,
};
use crate::project::ProjectConfigStore;
use crate::store::StateStore;

/// Image used when the configuration does not name one.
const DEFAULT_IMAGE: &str = "ubuntu:22.04";

/// Submission, stop, and deletion of runs.
///
/// Holds a per-project lock around run-name generation so two concurrent
/// anonymous submissions cannot mint the same name.
pub struct RunService<S> {
    store: Arc<S>,
    projects: Arc<dyn ProjectConfigStore>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: StateStore> RunService<S> {
    pub fn new(store: Arc<S>, projects: Arc<dyn ProjectConfigStore>) -> Self {
        Self {
            store,
            projects,
            name_locks: DashMap::new(),
        }
    }

    /// Create a run and its jobs in `SUBMITTED`.
    ///
    /// Re-submitting with a previously used `run_name` soft-deletes the old
    /// (finished) run and starts over with `submission_num = 0`; an active
    /// run with that name rejects the submission.
    pub async fn submit(&self, project: &str, mut spec: RunSpec) -> Result<Run> {
        let config = self
            .projects
            .get_project(project)
            .await?
            .ok_or_else(|| ClientError::ProjectNotFound(project.to_string()))?;
        if config.backends.is_empty() {
            return Err(ClientError::NoBackends(project.to_string()).into());
        }

        let run_name = match &spec.run_name {
            Some(name) => {
                validate_run_name(name)?;
                if let Some(existing) = self.store.get_run(project, name).await? {
                    let jobs = self.store.list_run_jobs(existing.id).await?;
                    if !run_status(&jobs).is_finished() {
                        return Err(ClientError::RunsActive(vec![name.clone()]).into());
                    }
                    self.store
                        .soft_delete_runs(project, &[name.clone()])
                        .await?;
                }
                name.clone()
            }
            None => self.generate_run_name(project).await?,
        };
        spec.run_name = Some(run_name.clone());

        let pool_name = spec.profile.pool_name().to_string();
        self.store.ensure_pool(project, &pool_name).await?;

        let now = Utc::now();
        let run = RunRecord {
            id: Uuid::new_v4(),
            project: project.to_string(),
            run_name: run_name.clone(),
            spec: spec.clone(),
            submitted_at: now,
            gateway_registered: false,
            deleted: false,
        };
        self.store.create_run(&run).await?;

        let gateway_hint = if spec.configuration.is_service() {
            self.service_gateway_hint(project, &run_name).await?
        } else {
            None
        };
        let mut jobs = Vec::new();
        for job_spec in jobs_from_run_spec(&spec, &pool_name, gateway_hint) {
            let job = JobRecord {
                id: Uuid::new_v4(),
                project: project.to_string(),
                run_id: run.id,
                run_name: run_name.clone(),
                job_num: job_spec.job_num,
                submission_num: 0,
                spec: job_spec,
                status: JobStatus::Submitted,
                error_code: None,
                provisioning_data: None,
                aborted: false,
                submitted_at: now,
                last_contact_at: None,
                last_processed_at: now,
            };
            self.store.create_job(&job).await?;
            jobs.push(job);
        }

        info!(project, run = %run_name, jobs = jobs.len(), "run submitted");
        Ok(assemble(run, jobs))
    }

    /// Stop runs: mark every non-terminal job `TERMINATING`. With `abort`,
    /// the terminating loop skips the graceful agent stop and finishes the
    /// jobs as `ABORTED`.
    pub async fn stop(&self, project: &str, run_names: &[String], abort: bool) -> Result<()> {
        for run_name in run_names {
            let Some(run) = self.store.get_run(project, run_name).await? else {
                continue;
            };
            for mut job in self.store.list_run_jobs(run.id).await? {
                if job.status.is_finished() || job.status == JobStatus::Terminating {
                    continue;
                }
                job.status = JobStatus::Terminating;
                job.aborted = abort;
                job.last_processed_at = Utc::now();
                self.store.update_job(&job).await?;
            }
            info!(project, run = %run_name, abort, "stop requested");
        }
        Ok(())
    }

    /// Tombstone finished runs. Rejects the whole batch when any named run
    /// is still active.
    pub async fn delete(&self, project: &str, run_names: &[String]) -> Result<()> {
        let mut active = Vec::new();
        for run_name in run_names {
            if let Some(run) = self.store.get_run(project, run_name).await? {
                let jobs = self.store.list_run_jobs(run.id).await?;
                if !run_status(&jobs).is_finished() {
                    active.push(run_name.clone());
                }
            }
        }
        if !active.is_empty() {
            return Err(ClientError::RunsActive(active).into());
        }
        self.store.soft_delete_runs(project, run_names).await
    }

    /// Assembled view of one run.
    pub async fn get(&self, project: &str, run_name: &str) -> Result<Option<Run>> {
        let Some(run) = self.store.get_run(project, run_name).await? else {
            return Ok(None);
        };
        let jobs = self.store.list_run_jobs(run.id).await?;
        Ok(Some(assemble(run, jobs)))
    }

    /// Assembled views of all live runs of a project, newest first.
    pub async fn list(&self, project: &str) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for record in self.store.list_runs(project).await? {
            let jobs = self.store.list_run_jobs(record.id).await?;
            runs.push(assemble(record, jobs));
        }
        runs.sort_by(|a, b| b.record.submitted_at.cmp(&a.record.submitted_at));
        Ok(runs)
    }

    async fn generate_run_name(&self, project: &str) -> Result<String> {
        let lock = self
            .name_locks
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = lock.lock().await;
        let base = random_name();
        let mut index = 1;
        loop {
            let candidate = format!("{base}-{index}");
            if self.store.get_run(project, &candidate).await?.is_none() {
                return Ok(candidate);
            }
            index += 1;
        }
    }

    /// Hostname hint for a service run, derived from the project's first
    /// gateway with a wildcard domain.
    async fn service_gateway_hint(
        &self,
        project: &str,
        run_name: &str,
    ) -> Result<Option<GatewayHint>> {
        let gateways = self.store.list_gateways(project).await?;
        Ok(gateways
            .iter()
            .find_map(|gateway| gateway.wildcard_domain.as_deref())
            .map(|domain| GatewayHint {
                hostname: format!("{run_name}.{domain}"),
                public_port: 443,
                secure: true,
            }))
    }
}

fn assemble(record: RunRecord, jobs: Vec<JobRecord>) -> Run {
    let now = Utc::now();
    let status = run_status(&jobs);
    let cost = run_cost(&jobs, now);
    let service = service_info(&record.spec, &jobs);
    Run {
        record,
        jobs,
        status,
        cost,
        service,
    }
}

/// Expand a run spec into its job specs. Today every configuration maps to
/// a single job; the `job_num` plumbing exists for multi-node runs.
fn jobs_from_run_spec(
    spec: &RunSpec,
    pool_name: &str,
    gateway: Option<GatewayHint>,
) -> Vec<JobSpec> {
    let run_name = spec.run_name.as_deref().unwrap_or("run");
    let configuration = &spec.configuration;
    let image = configuration
        .image()
        .unwrap_or(DEFAULT_IMAGE)
        .to_string();
    let (commands, env, mut ports) = match configuration {
        RunConfiguration::DevEnvironment(config) => {
            (config.init.clone(), config.env.clone(), config.ports.clone())
        }
        RunConfiguration::Task(config) => {
            (config.commands.clone(), config.env.clone(), config.ports.clone())
        }
        RunConfiguration::Service(config) => {
            (config.commands.clone(), config.env.clone(), vec![config.port])
        }
    };
    ports.sort_unstable();
    ports.dedup();
    vec![JobSpec {
        job_num: 0,
        job_name: format!("{run_name}-0"),
        image,
        entrypoint: None,
        commands,
        env,
        ports,
        requirements: configuration.resources().clone(),
        gateway,
        pool_name: Some(pool_name.to_string()),
        working_dir: None,
    }]
}

fn validate_run_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_chars || name.len() < 2 || name.len() > 100 {
        return Err(ClientError::InvalidRunSpec(format!(
            "invalid run name {name:?}: use 2-100 alphanumeric, dash, or underscore characters"
        ))
        .into());
    }
    Ok(())
}

/// A readable two-word name. Randomness comes from a v4 UUID so the service
/// needs no RNG dependency of its own.
fn random_name() -> String {
    const ADJECTIVES: &[&str] = &[
        "brave", "calm", "clever", "eager", "gentle", "jolly", "keen", "lively", "mellow",
        "nimble", "proud", "quiet", "rapid", "sharp", "sunny", "witty",
    ];
    const ANIMALS: &[&str] = &[
        "otter", "heron", "lynx", "puffin", "stoat", "tapir", "wren", "yak", "zebra", "ibis",
        "koala", "lemur", "mole", "newt", "orca", "panda",
    ];
    let bytes = *Uuid::new_v4().as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
    format!("{adjective}-{animal}")
}
