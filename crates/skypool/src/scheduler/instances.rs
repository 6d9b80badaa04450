//! `process_idle_instances`: instance lifecycle outside a job.
//!
//! One loop owns every instance-only transition: bringing fleet-launched
//! instances up (`CREATING -> STARTING -> READY`), reaping instances idle
//! past their `termination_idle_time`, and retrying terminations that did
//! not go through (`terminate_instance` is idempotent, so retrying is
//! always safe).

use chrono::Utc;
use tracing::{info, warn};

use anyhow::Result;

use crate::backend::RequestStatus;
use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::models::profile::TerminationPolicy;
use crate::scheduler::{snapshot, InFlightGuard, Scheduler};
use crate::store::StateStore;

impl<S: StateStore> Scheduler<S> {
    /// One tick of the instance loop: advance at most one instance.
    pub async fn process_idle_instances(&self) -> Result<()> {
        let exclude = snapshot(&self.inflight.instances);
        let statuses = [
            InstanceStatus::Creating,
            InstanceStatus::Starting,
            InstanceStatus::Idle,
            InstanceStatus::Terminating,
        ];
        let Some(instance) = self
            .store
            .next_instance_in_statuses(&statuses, &exclude)
            .await?
        else {
            return Ok(());
        };
        let Some(_guard) = InFlightGuard::claim(&self.inflight.instances, instance.id) else {
            return Ok(());
        };
        match instance.status {
            InstanceStatus::Creating => self.advance_creating(instance).await,
            InstanceStatus::Starting => self.advance_starting(instance).await,
            InstanceStatus::Idle => self.reap_idle(instance).await,
            InstanceStatus::Terminating => self.terminate_instance_vm(&instance).await,
            _ => Ok(()),
        }
    }

    /// `CREATING`: the backend accepted the launch; wait until it reports
    /// the VM running, then start probing the agent.
    async fn advance_creating(&self, instance: InstanceRecord) -> Result<()> {
        let Some(adapter) = self.backends.get(instance.backend) else {
            warn!(instance = %instance.name, backend = %instance.backend, "no adapter for backend");
            return Ok(());
        };
        let head = tokio::time::timeout(
            self.config.agent_timeout,
            adapter.get_request_head(&instance.provisioning_data),
        )
        .await;
        match head {
            Ok(Ok(RequestStatus::Running)) => {
                self.store
                    .transition_instance(
                        instance.id,
                        InstanceStatus::Creating,
                        InstanceStatus::Starting,
                    )
                    .await?;
                Ok(())
            }
            Ok(Ok(RequestStatus::NoCapacity | RequestStatus::Terminated)) => {
                warn!(instance = %instance.name, "launch request died; recording as terminated");
                let mut gone = instance;
                gone.status = InstanceStatus::Terminated;
                gone.job_id = None;
                self.store.update_instance(&gone).await
            }
            _ => Ok(()), // still provisioning, or no answer: next tick
        }
    }

    /// `STARTING`: VM is up; ready once the agent answers.
    async fn advance_starting(&self, instance: InstanceRecord) -> Result<()> {
        let probe = tokio::time::timeout(
            self.config.agent_timeout,
            self.agent.healthcheck(&instance.provisioning_data),
        )
        .await;
        if matches!(probe, Ok(Ok(()))) {
            info!(instance = %instance.name, "instance ready");
            self.store
                .transition_instance(instance.id, InstanceStatus::Starting, InstanceStatus::Ready)
                .await?;
            return Ok(());
        }
        // An instance that never comes up is destroyed after the same grace
        // window as an unreachable running host.
        let grace = chrono::Duration::from_std(self.config.unreachable_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        if Utc::now() - instance.created_at >= grace {
            warn!(instance = %instance.name, "agent never came up; destroying");
            if self
                .store
                .transition_instance(
                    instance.id,
                    InstanceStatus::Starting,
                    InstanceStatus::Terminating,
                )
                .await?
            {
                self.terminate_instance_vm(&instance).await?;
            }
        }
        Ok(())
    }

    /// `IDLE`: destroy once idle time exceeds the instance's policy.
    async fn reap_idle(&self, instance: InstanceRecord) -> Result<()> {
        if instance.termination_policy == TerminationPolicy::DontDestroy {
            return Ok(());
        }
        let now = Utc::now();
        let Some(idle_for) = instance.idle_for(now) else {
            // IDLE without idle_since is an invariant slip; stamp it now so
            // the clock at least starts.
            warn!(instance = %instance.name, "idle instance without idle_since; stamping");
            let mut patched = instance;
            patched.idle_since = Some(now);
            return self.store.update_instance(&patched).await;
        };
        let limit = chrono::Duration::from_std(instance.termination_idle_time)
            .unwrap_or_else(|_| chrono::Duration::days(3));
        if idle_for < limit {
            return Ok(());
        }
        info!(
            instance = %instance.name,
            idle_hours = idle_for.num_hours(),
            "idle past termination_idle_time; reaping"
        );
        if self
            .store
            .transition_instance(instance.id, InstanceStatus::Idle, InstanceStatus::Terminating)
            .await?
        {
            self.terminate_instance_vm(&instance).await?;
        }
        Ok(())
    }

    /// Call the backend to tear the VM down and record the result. The
    /// instance must already be in `TERMINATING`; on failure it stays there
    /// and the next tick retries.
    pub(crate) async fn terminate_instance_vm(&self, instance: &InstanceRecord) -> Result<()> {
        let Some(adapter) = self.backends.get(instance.backend) else {
            warn!(instance = %instance.name, backend = %instance.backend, "no adapter for backend");
            return Ok(());
        };
        let result = tokio::time::timeout(
            self.config.terminate_timeout,
            adapter.terminate_instance(&instance.provisioning_data),
        )
        .await;
        match result {
            Ok(Ok(())) => {
                self.store
                    .transition_instance(
                        instance.id,
                        InstanceStatus::Terminating,
                        InstanceStatus::Terminated,
                    )
                    .await?;
                info!(instance = %instance.name, "instance terminated");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(instance = %instance.name, error = %err, "terminate failed; will retry");
                Ok(())
            }
            Err(_) => {
                warn!(instance = %instance.name, "terminate timed out; will retry");
                Ok(())
            }
        }
    }
}
