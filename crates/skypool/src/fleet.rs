//! Fleets: pre-provisioning pool capacity declaratively.
//!
//! Applying a fleet walks the same priced offer list as job provisioning,
//! but through the backends' `create_instance` surface: the instances come
//! up with no job attached and park as `READY` for later reuse.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendRegistry, InstanceConfiguration};
use crate::config::SchedulerConfig;
use crate::error::ClientError;
use crate::models::fleet::{FleetRecord, FleetSpec, FleetStatus};
use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::project::ProjectConfigStore;
use crate::provision::{provision_instance, ProvisionTimeouts};
use crate::store::StateStore;

pub struct FleetService<S> {
    store: Arc<S>,
    backends: Arc<BackendRegistry>,
    projects: Arc<dyn ProjectConfigStore>,
    config: SchedulerConfig,
}

impl<S: StateStore> FleetService<S> {
    pub fn new(
        store: Arc<S>,
        backends: Arc<BackendRegistry>,
        projects: Arc<dyn ProjectConfigStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            backends,
            projects,
            config,
        }
    }

    /// Create the fleet and launch its minimum node count.
    ///
    /// Instances are persisted in `CREATING` right after each successful
    /// launch; the instance loop brings them to `READY`. The fleet ends up
    /// `ACTIVE` when at least one node launched, `FAILED` otherwise.
    pub async fn apply(&self, project: &str, spec: FleetSpec) -> Result<FleetRecord> {
        let config = self
            .projects
            .get_project(project)
            .await?
            .ok_or_else(|| ClientError::ProjectNotFound(project.to_string()))?;
        if config.backends.is_empty() {
            return Err(ClientError::NoBackends(project.to_string()).into());
        }

        let profile = spec.effective_profile();
        let pool_name = profile
            .pool_name
            .clone()
            .unwrap_or_else(|| spec.configuration.name.clone());
        let pool = self.store.ensure_pool(project, &pool_name).await?;

        let now = Utc::now();
        let mut fleet = FleetRecord {
            id: Uuid::new_v4(),
            project: project.to_string(),
            name: spec.configuration.name.clone(),
            spec: spec.clone(),
            status: FleetStatus::Submitted,
            status_message: None,
            created_at: now,
        };
        self.store.create_fleet(&fleet).await?;

        let timeouts = ProvisionTimeouts {
            offer_query: self.config.offer_query_timeout,
            launch: self.config.launch_timeout,
        };
        let mut launched = 0u32;
        for node in 0..spec.configuration.nodes.min {
            let instance_name = format!("{}-{node}", spec.configuration.name);
            let instance_config = InstanceConfiguration {
                instance_name: instance_name.clone(),
                pool_name: pool_name.clone(),
                ssh_keys: config.ssh_keys.clone(),
            };
            let provisioned = match provision_instance(
                &self.backends,
                &config.backends,
                project,
                &profile,
                &spec.configuration.resources,
                &instance_config,
                pool.id,
                timeouts,
            )
            .await
            {
                Ok(Some(provisioned)) => provisioned,
                Ok(None) => {
                    warn!(fleet = %fleet.name, node, "no capacity for fleet node");
                    continue;
                }
                Err(err) => {
                    warn!(fleet = %fleet.name, node, error = %err, "fatal error launching fleet node");
                    break;
                }
            };
            let instance = InstanceRecord {
                id: Uuid::new_v4(),
                project: project.to_string(),
                pool_id: pool.id,
                name: instance_name,
                status: InstanceStatus::Creating,
                offer: provisioned.offer.clone(),
                provisioning_data: provisioned.data,
                termination_policy: profile.termination_policy,
                termination_idle_time: profile.termination_idle_time(),
                backend: provisioned.offer.backend,
                region: provisioned.offer.region.clone(),
                price: provisioned.offer.price,
                job_id: None,
                idle_since: None,
                created_at: Utc::now(),
            };
            self.store.create_instance(&instance).await?;
            launched += 1;
        }

        fleet.status = if launched > 0 {
            FleetStatus::Active
        } else {
            FleetStatus::Failed
        };
        if launched < spec.configuration.nodes.min {
            fleet.status_message = Some(format!(
                "launched {launched} of {} nodes",
                spec.configuration.nodes.min
            ));
        }
        self.store.update_fleet(&fleet).await?;
        info!(
            fleet = %fleet.name,
            launched,
            requested = spec.configuration.nodes.min,
            status = ?fleet.status,
            "fleet applied"
        );
        Ok(fleet)
    }
}
