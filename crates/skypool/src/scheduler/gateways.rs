//! `process_gateways`: keep the gateway's view of `service` runs in sync
//! with their actual status.
//!
//! Registration happens once a service run reaches `RUNNING`; terminal runs
//! are unregistered. Both gateway calls are idempotent, so a crash between
//! the call and the flag write costs one repeated call, not correctness.

use tracing::warn;

use anyhow::Result;

use crate::models::run::run_status;
use crate::scheduler::{InFlightGuard, Scheduler};
use crate::store::StateStore;

impl<S: StateStore> Scheduler<S> {
    /// One tick of the gateway loop.
    pub async fn process_gateways(&self) -> Result<()> {
        for run in self.store.list_service_runs(false).await? {
            let Some(_guard) = InFlightGuard::claim(&self.inflight.gateways, run.id) else {
                continue;
            };
            let jobs = self.store.list_run_jobs(run.id).await?;
            if run_status(&jobs) != crate::models::job::JobStatus::Running {
                continue;
            }
            match self
                .gateway
                .register_service(&run.project, &run.run_name, &jobs)
                .await
            {
                Ok(()) => {
                    self.store.set_gateway_registered(run.id, true).await?;
                }
                Err(err) => {
                    warn!(run = %run.run_name, error = ?err, "gateway registration failed");
                }
            }
        }

        for run in self.store.list_service_runs(true).await? {
            let Some(_guard) = InFlightGuard::claim(&self.inflight.gateways, run.id) else {
                continue;
            };
            let jobs = self.store.list_run_jobs(run.id).await?;
            if !run_status(&jobs).is_finished() {
                continue;
            }
            match self
                .gateway
                .unregister_service(&run.project, &run.run_name)
                .await
            {
                Ok(()) => {
                    self.store.set_gateway_registered(run.id, false).await?;
                }
                Err(err) => {
                    warn!(run = %run.run_name, error = ?err, "gateway unregistration failed");
                }
            }
        }
        Ok(())
    }
}
