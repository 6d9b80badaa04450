//! Fleets: declarative instance groups that pre-populate a pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendType;
use crate::models::profile::{Profile, RetryPolicy, SpotPolicy, TerminationPolicy};
use crate::models::resources::Requirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetStatus {
    Submitted,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Any,
    Cluster,
}

/// How many instances the fleet maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRange {
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

/// Declarative fleet description. The provisioning knobs mirror
/// [`Profile`]; a knob set here overrides the accompanying profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfiguration {
    pub name: String,
    pub nodes: NodeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    #[serde(default)]
    pub resources: Requirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<BackendType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_policy: Option<SpotPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub termination_idle_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetSpec {
    pub configuration: FleetConfiguration,
    #[serde(default)]
    pub profile: Profile,
}

impl FleetSpec {
    /// Merge the configuration's overrides into the profile: a knob set in
    /// the configuration wins over the same knob in the profile.
    pub fn effective_profile(&self) -> Profile {
        let conf = &self.configuration;
        let mut profile = self.profile.clone();
        if conf.backends.is_some() {
            profile.backends = conf.backends.clone();
        }
        if conf.regions.is_some() {
            profile.regions = conf.regions.clone();
        }
        if conf.instance_types.is_some() {
            profile.instance_types = conf.instance_types.clone();
        }
        if conf.spot_policy.is_some() {
            profile.spot_policy = conf.spot_policy;
        }
        if let Some(retry) = conf.retry {
            profile.retry = retry;
        }
        if conf.max_price.is_some() {
            profile.max_price = conf.max_price;
        }
        if let Some(policy) = conf.termination_policy {
            profile.termination_policy = policy;
        }
        if conf.termination_idle_time.is_some() {
            profile.termination_idle_time = conf.termination_idle_time;
        }
        profile
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetRecord {
    pub id: Uuid,
    pub project: String,
    pub name: String,
    pub spec: FleetSpec,
    pub status: FleetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
