//! Offer aggregation: one priced, deterministically ordered list across
//! every enabled backend.
//!
//! Backends are queried concurrently, each under its own timeout. A backend
//! that fails or times out is dropped from this call only — capacity
//! elsewhere must not hinge on one provider's bad day.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::warn;

use crate::backend::{BackendRegistry, BackendType, Compute};
use crate::models::instance::Offer;
use crate::models::profile::{Profile, SpotPolicy};
use crate::models::resources::Requirements;

/// Query each backend for offers matching `requirements`, merge and sort.
///
/// The result is a pure function of the inputs modulo what the backends
/// answer: the final ordering is fully determined by [`sort_offers`].
pub async fn list_offers(
    registry: &BackendRegistry,
    backends: &[BackendType],
    requirements: &Requirements,
    exclude_unavailable: bool,
    per_backend_timeout: Duration,
) -> Vec<Offer> {
    let adapters = registry.resolve(backends);
    let queries = adapters.iter().map(|adapter| {
        let adapter: Arc<dyn Compute> = adapter.clone();
        async move {
            let backend = adapter.backend_type();
            match tokio::time::timeout(per_backend_timeout, adapter.get_offers(requirements)).await
            {
                Ok(Ok(offers)) => offers,
                Ok(Err(err)) => {
                    warn!(%backend, error = %err, "dropping backend from offer query");
                    Vec::new()
                }
                Err(_) => {
                    warn!(%backend, timeout = ?per_backend_timeout, "offer query timed out");
                    Vec::new()
                }
            }
        }
    });

    let mut offers: Vec<Offer> = join_all(queries).await.into_iter().flatten().collect();
    if exclude_unavailable {
        offers.retain(|offer| offer.availability.is_available());
    }
    sort_offers(&mut offers);
    offers
}

/// Whether an offer passes a profile's provisioning filters.
///
/// The pool manager applies the same predicate to the frozen offer of a
/// candidate instance, so reuse and fresh provisioning obey identical rules.
pub fn matches_profile(offer: &Offer, profile: &Profile) -> bool {
    if let Some(backends) = &profile.backends {
        if !backends.contains(&offer.backend) {
            return false;
        }
    }
    if let Some(regions) = &profile.regions {
        if !regions.iter().any(|r| r.eq_ignore_ascii_case(&offer.region)) {
            return false;
        }
    }
    if let Some(instance_types) = &profile.instance_types {
        if !instance_types.contains(&offer.instance_type.name) {
            return false;
        }
    }
    if let Some(max_price) = profile.max_price {
        if offer.price > max_price {
            return false;
        }
    }
    match profile.spot_policy() {
        SpotPolicy::Spot if !offer.spot => return false,
        SpotPolicy::OnDemand if offer.spot => return false,
        _ => {}
    }
    true
}

/// Offers that pass the profile filters and whose hardware satisfies the
/// requirements, sorted.
pub async fn list_profile_offers(
    registry: &BackendRegistry,
    project_backends: &[BackendType],
    profile: &Profile,
    requirements: &Requirements,
    exclude_unavailable: bool,
    per_backend_timeout: Duration,
) -> Vec<Offer> {
    let enabled: Vec<BackendType> = match &profile.backends {
        Some(allowed) => project_backends
            .iter()
            .copied()
            .filter(|b| allowed.contains(b))
            .collect(),
        None => project_backends.to_vec(),
    };
    let mut offers = list_offers(
        registry,
        &enabled,
        requirements,
        exclude_unavailable,
        per_backend_timeout,
    )
    .await;
    offers.retain(|offer| {
        matches_profile(offer, profile) && offer.instance_type.resources.satisfies(requirements)
    });
    offers
}

/// Deterministic offer ordering: price ascending, spot before on-demand at
/// equal price, then backend, region, and instance type as tie-breaks.
pub fn sort_offers(offers: &mut [Offer]) {
    offers.sort_by(|a, b| {
        a.price
            .total_cmp(&b.price)
            .then_with(|| b.spot.cmp(&a.spot))
            .then_with(|| a.backend.as_str().cmp(b.backend.as_str()))
            .then_with(|| a.region.cmp(&b.region))
            .then_with(|| a.instance_type.name.cmp(&b.instance_type.name))
    });
}
