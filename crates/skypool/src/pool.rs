//! Pool management: reusing instances a project already pays for.
//!
//! The selection logic is pure (filter + tie-break); the mutations ride on
//! the store's CAS primitives so two schedulers' worth of loops can never
//! give one instance two owners.

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ClientError;
use crate::models::instance::{InstanceRecord, InstanceStatus};
use crate::models::profile::Profile;
use crate::models::resources::Requirements;
use crate::offers::matches_profile;
use crate::store::{ReleaseOutcome, StateStore};

/// Instances in `status` whose frozen offer passes the profile filters and
/// whose hardware satisfies the requirements.
///
/// Uses the exact same offer predicate as the aggregator, so an instance is
/// reusable iff its original offer would be provisionable today.
pub fn filter_instances<'a>(
    instances: &'a [InstanceRecord],
    profile: &Profile,
    requirements: &Requirements,
    status: InstanceStatus,
) -> Vec<&'a InstanceRecord> {
    instances
        .iter()
        .filter(|instance| {
            instance.status == status
                && matches_profile(&instance.offer, profile)
                && instance
                    .offer
                    .instance_type
                    .resources
                    .satisfies(requirements)
        })
        .collect()
}

/// Deterministic tie-break among candidates: lowest price, then
/// lexicographic instance name.
pub fn pick_best<'a>(candidates: &[&'a InstanceRecord]) -> Option<&'a InstanceRecord> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| a.price.total_cmp(&b.price).then_with(|| a.name.cmp(&b.name)))
}

/// Candidates ordered best-first, for callers that walk the list attempting
/// claims until one sticks.
pub fn rank_candidates<'a>(candidates: &[&'a InstanceRecord]) -> Vec<&'a InstanceRecord> {
    let mut ranked: Vec<&InstanceRecord> = candidates.to_vec();
    ranked.sort_by(|a, b| a.price.total_cmp(&b.price).then_with(|| a.name.cmp(&b.name)));
    ranked
}

/// Atomically claim a `READY` instance for a job. A `false` return means
/// another claimer won; the caller moves on to its next candidate.
pub async fn claim<S: StateStore + ?Sized>(
    store: &S,
    instance: &InstanceRecord,
    job_id: Uuid,
) -> Result<bool> {
    let claimed = store.claim_instance(instance.id, job_id).await?;
    if claimed {
        info!(instance = %instance.name, %job_id, "claimed pool instance");
    } else {
        debug!(instance = %instance.name, %job_id, "lost claim race");
    }
    Ok(claimed)
}

/// Release a `BUSY` instance after its job let go of it.
pub async fn release<S: StateStore + ?Sized>(
    store: &S,
    instance_id: Uuid,
    outcome: ReleaseOutcome,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<bool> {
    store.release_instance(instance_id, outcome, now).await
}

/// Delete a pool, rejecting the call while instances are still alive in it.
pub async fn delete_pool<S: StateStore + ?Sized>(
    store: &S,
    project: &str,
    name: &str,
) -> Result<()> {
    let pool = store
        .get_pool(project, name)
        .await?
        .ok_or_else(|| ClientError::PoolNotFound(name.to_string()))?;
    if !store.soft_delete_pool(pool.id).await? {
        return Err(ClientError::PoolInUse(name.to_string()).into());
    }
    Ok(())
}
