//! The control loops.
//!
//! Five periodic loops share one scheduler: submitted jobs, running jobs,
//! terminating jobs, instance lifecycle (startup + idle reaping), and
//! gateway registration. Each loop follows the same claim-advance-release
//! shape:
//!
//! 1. a status-scoped store query picks the oldest entity not already in
//!    the loop's in-flight set;
//! 2. the id goes into the set behind an RAII guard, so a panic or early
//!    return can never leak it;
//! 3. the slow work (backend calls, agent round-trips) happens outside any
//!    store transaction;
//! 4. the outcome is written back, and the guard drop releases the id.
//!
//! The database is the source of truth; the in-flight sets only prevent a
//! loop from racing itself within a tick. Cross-loop races on instances go
//! through the store's CAS primitives instead.

mod gateways;
mod instances;
mod running;
mod submitted;
mod terminating;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::backend::BackendRegistry;
use crate::config::SchedulerConfig;
use crate::gateway::GatewayService;
use crate::heads::{self, HeadStore};
use crate::models::job::{JobErrorCode, JobRecord, JobStatus};
use crate::models::run::{run_cost, run_status, RunHead};
use crate::project::ProjectConfigStore;
use crate::store::StateStore;

/// Per-loop in-flight id sets. Advisory only: they keep one loop from
/// claiming the same entity twice, nothing more.
#[derive(Default)]
pub(crate) struct InFlight {
    pub(crate) submitted: DashSet<Uuid>,
    pub(crate) running: DashSet<Uuid>,
    pub(crate) terminating: DashSet<Uuid>,
    pub(crate) instances: DashSet<Uuid>,
    pub(crate) gateways: DashSet<Uuid>,
}

pub(crate) fn snapshot(set: &DashSet<Uuid>) -> Vec<Uuid> {
    set.iter().map(|id| *id).collect()
}

/// RAII membership in an in-flight set. Dropping the guard removes the id,
/// so the set is correct on every exit path, panics included.
pub(crate) struct InFlightGuard<'a> {
    set: &'a DashSet<Uuid>,
    id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    /// `None` when the id is already in flight.
    pub(crate) fn claim(set: &'a DashSet<Uuid>, id: Uuid) -> Option<Self> {
        set.insert(id).then_some(Self { set, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// The scheduling control plane. One instance per process; loops started
/// with [`Scheduler::start`] share it behind an `Arc`.
pub struct Scheduler<S> {
    pub(crate) store: Arc<S>,
    pub(crate) backends: Arc<BackendRegistry>,
    pub(crate) projects: Arc<dyn ProjectConfigStore>,
    pub(crate) agent: Arc<dyn Agent>,
    pub(crate) gateway: Arc<dyn GatewayService>,
    pub(crate) heads: Arc<dyn HeadStore>,
    pub(crate) config: SchedulerConfig,
    pub(crate) inflight: InFlight,
}

impl<S: StateStore> Scheduler<S> {
    pub fn builder(store: Arc<S>, backends: Arc<BackendRegistry>) -> SchedulerBuilder<S> {
        SchedulerBuilder {
            store,
            backends,
            projects: None,
            agent: None,
            gateway: None,
            heads: None,
            config: SchedulerConfig::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Commit a job row: stamp `last_processed_at`, write it, refresh the
    /// run head. Head failures are logged, never fatal — the head is a
    /// summary, not the truth.
    pub(crate) async fn commit_job(&self, job: &mut JobRecord) -> Result<()> {
        job.last_processed_at = Utc::now();
        self.store.update_job(job).await?;
        if let Err(err) = self.refresh_run_head(job.run_id).await {
            warn!(run_id = %job.run_id, error = ?err, "failed to refresh run head");
        }
        Ok(())
    }

    /// Move a job along a legal edge and commit. An illegal edge is an
    /// internal invariant violation: logged at error level and the job is
    /// pushed to `FAILED` rather than retried forever.
    pub(crate) async fn transition_job(
        &self,
        job: &mut JobRecord,
        next: JobStatus,
        error_code: Option<JobErrorCode>,
    ) -> Result<()> {
        if job.status.can_transition_to(next) {
            job.status = next;
            job.error_code = error_code;
        } else if !job.status.is_finished() {
            error!(
                job_id = %job.id,
                from = %job.status,
                to = %next,
                "illegal job transition; failing job"
            );
            job.status = JobStatus::Failed;
        } else {
            warn!(
                job_id = %job.id,
                from = %job.status,
                to = %next,
                "ignoring transition out of terminal status"
            );
            return Ok(());
        }
        self.commit_job(job).await
    }

    pub(crate) async fn refresh_run_head(&self, run_id: Uuid) -> Result<()> {
        let Some(run) = self.store.get_run_by_id(run_id).await? else {
            return Ok(());
        };
        let jobs = self.store.list_run_jobs(run_id).await?;
        let head = RunHead {
            run_name: run.run_name.clone(),
            project: run.project.clone(),
            status: run_status(&jobs),
            submitted_at: run.submitted_at,
            error_code: jobs.iter().find_map(|job| job.error_code),
            cost: run_cost(&jobs, Utc::now()),
        };
        heads::put_run_head(self.heads.as_ref(), &head).await
    }
}

impl<S: StateStore + 'static> Scheduler<S> {
    /// Spawn all five loops on their tickers. The returned handle owns the
    /// shared stop signal.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let tasks = vec![
            self.spawn_loop("process_submitted_jobs", cancel.clone(), |s| async move {
                s.process_submitted_jobs().await
            }),
            self.spawn_loop("process_running_jobs", cancel.clone(), |s| async move {
                s.process_running_jobs().await
            }),
            self.spawn_loop("process_terminating_jobs", cancel.clone(), |s| async move {
                s.process_terminating_jobs().await
            }),
            self.spawn_loop("process_idle_instances", cancel.clone(), |s| async move {
                s.process_idle_instances().await
            }),
            self.spawn_loop("process_gateways", cancel.clone(), |s| async move {
                s.process_gateways().await
            }),
        ];
        SchedulerHandle { cancel, tasks }
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        cancel: CancellationToken,
        step: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let tick = scheduler.config.tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = step(Arc::clone(&scheduler)).await {
                            warn!(task = name, error = ?err, "control loop step failed");
                        }
                    }
                }
            }
            debug!(task = name, "control loop stopped");
        })
    }
}

/// Stop signal plus the spawned loop tasks.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop to stop after its current step.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the loops to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Builder for [`Scheduler`]. The store and backend registry are required
/// up front; the remaining collaborators must be supplied before `build`.
pub struct SchedulerBuilder<S> {
    store: Arc<S>,
    backends: Arc<BackendRegistry>,
    projects: Option<Arc<dyn ProjectConfigStore>>,
    agent: Option<Arc<dyn Agent>>,
    gateway: Option<Arc<dyn GatewayService>>,
    heads: Option<Arc<dyn HeadStore>>,
    config: SchedulerConfig,
}

impl<S: StateStore> SchedulerBuilder<S> {
    pub fn with_projects(mut self, projects: Arc<dyn ProjectConfigStore>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn GatewayService>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_heads(mut self, heads: Arc<dyn HeadStore>) -> Self {
        self.heads = Some(heads);
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Scheduler<S>> {
        Ok(Scheduler {
            store: self.store,
            backends: self.backends,
            projects: self
                .projects
                .ok_or_else(|| anyhow::anyhow!("scheduler requires a project config store"))?,
            agent: self
                .agent
                .ok_or_else(|| anyhow::anyhow!("scheduler requires an agent transport"))?,
            gateway: self
                .gateway
                .ok_or_else(|| anyhow::anyhow!("scheduler requires a gateway service"))?,
            heads: self
                .heads
                .ok_or_else(|| anyhow::anyhow!("scheduler requires a head store"))?,
            config: self.config,
            inflight: InFlight::default(),
        })
    }
}
