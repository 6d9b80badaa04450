//! The provisioner: walk the offer list, launch on the first backend that
//! takes the job.
//!
//! Retriable failures (capacity, quota, flapping APIs, timeouts) fall
//! through to the next offer; a fatal failure (bad credentials, malformed
//! request) aborts the whole attempt so a misconfigured project does not
//! hammer every region of every backend.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendRegistry, BackendType, InstanceConfiguration, SshKeys};
use crate::error::BackendError;
use crate::models::instance::{JobProvisioningData, Offer};
use crate::models::job::JobSpec;
use crate::models::profile::Profile;
use crate::models::resources::Requirements;
use crate::models::run::RunSpec;
use crate::offers::list_profile_offers;

/// A successful launch: the durable provisioning data plus the offer it was
/// bought at.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub data: JobProvisioningData,
    pub offer: Offer,
}

/// Timeouts the provisioner operates under.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionTimeouts {
    pub offer_query: Duration,
    pub launch: Duration,
}

/// Try to launch `job` on the cheapest offer that will take it.
///
/// Returns `Ok(None)` when every offer was exhausted with retriable
/// failures — the caller applies the retry policy. Returns `Err` only for
/// fatal backend errors.
pub async fn provision_job(
    registry: &BackendRegistry,
    project_backends: &[BackendType],
    run: &RunSpec,
    job: &JobSpec,
    ssh_keys: &SshKeys,
    pool_id: Uuid,
    timeouts: ProvisionTimeouts,
) -> Result<Option<Provisioned>, BackendError> {
    let offers = list_profile_offers(
        registry,
        project_backends,
        &run.profile,
        &job.requirements,
        true,
        timeouts.offer_query,
    )
    .await;

    for offer in offers {
        let Some(adapter) = registry.get(offer.backend) else {
            continue;
        };
        debug!(
            backend = %offer.backend,
            instance_type = %offer.instance_type.name,
            region = %offer.region,
            price = offer.price,
            "trying offer"
        );
        let launch = tokio::time::timeout(
            timeouts.launch,
            adapter.run_job(run, job, &offer, ssh_keys),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(timeouts.launch)));
        match launch {
            Ok(info) => {
                let data = JobProvisioningData::from_launch(&offer, info, pool_id);
                return Ok(Some(Provisioned { data, offer }));
            }
            Err(err) if err.is_retriable() => {
                warn!(
                    backend = %offer.backend,
                    instance_type = %offer.instance_type.name,
                    region = %offer.region,
                    error = %err,
                    "launch failed, trying next offer"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

/// Fleet path: launch a bare pool instance with no job attached.
///
/// Same walk and same failure classification as [`provision_job`], against
/// the backends' `create_instance` surface.
pub async fn provision_instance(
    registry: &BackendRegistry,
    project_backends: &[BackendType],
    project: &str,
    profile: &Profile,
    requirements: &Requirements,
    config: &InstanceConfiguration,
    pool_id: Uuid,
    timeouts: ProvisionTimeouts,
) -> Result<Option<Provisioned>, BackendError> {
    let offers = list_profile_offers(
        registry,
        project_backends,
        profile,
        requirements,
        true,
        timeouts.offer_query,
    )
    .await;

    for offer in offers {
        let Some(adapter) = registry.get(offer.backend) else {
            continue;
        };
        debug!(
            backend = %offer.backend,
            instance_type = %offer.instance_type.name,
            region = %offer.region,
            price = offer.price,
            instance = %config.instance_name,
            "trying offer for pool instance"
        );
        let launch = tokio::time::timeout(
            timeouts.launch,
            adapter.create_instance(project, &offer, config),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(timeouts.launch)));
        match launch {
            Ok(info) => {
                let data = JobProvisioningData::from_launch(&offer, info, pool_id);
                return Ok(Some(Provisioned { data, offer }));
            }
            Err(err) if err.is_retriable() => {
                warn!(
                    backend = %offer.backend,
                    instance_type = %offer.instance_type.name,
                    region = %offer.region,
                    error = %err,
                    "instance launch failed, trying next offer"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}
