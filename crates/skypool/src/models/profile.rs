//! The tunable policy block attached to a run or fleet.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendType;

/// Name of the pool implicitly created for a project on first use.
pub const DEFAULT_POOL_NAME: &str = "default";

/// Retry window applied when the profile says `retry: true`.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60 * 60);

/// How long an idle instance survives before the reaper destroys it.
pub const DEFAULT_TERMINATION_IDLE_TIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpotPolicy {
    Spot,
    OnDemand,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreationPolicy {
    /// Only reuse a ready pool instance; never provision.
    Reuse,
    /// Reuse when possible, otherwise provision a fresh instance.
    #[default]
    ReuseOrCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationPolicy {
    #[default]
    DestroyAfterIdle,
    DontDestroy,
}

/// Provisioning retry: off, on with the default window, or an explicit
/// window (`retry: 90m`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    Flag(bool),
    Window(#[serde(with = "humantime_serde")] Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Flag(false)
    }
}

impl RetryPolicy {
    /// The effective retry window, or `None` when retry is off.
    pub fn window(&self) -> Option<Duration> {
        match self {
            RetryPolicy::Flag(false) => None,
            RetryPolicy::Flag(true) => Some(DEFAULT_RETRY_WINDOW),
            RetryPolicy::Window(window) => Some(*window),
        }
    }
}

/// Scheduling knobs for a run. Every field has a default so a bare `{}`
/// profile is valid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Profile {
    /// Restrict provisioning to these backends.
    pub backends: Option<Vec<BackendType>>,
    /// Restrict provisioning to these regions.
    pub regions: Option<Vec<String>>,
    /// Restrict provisioning to these cloud-specific instance types.
    pub instance_types: Option<Vec<String>>,
    pub spot_policy: Option<SpotPolicy>,
    pub retry: RetryPolicy,
    pub creation_policy: CreationPolicy,
    pub termination_policy: TerminationPolicy,
    #[serde(with = "humantime_serde")]
    pub termination_idle_time: Option<Duration>,
    pub pool_name: Option<String>,
    pub max_price: Option<f64>,
}

impl Profile {
    pub fn spot_policy(&self) -> SpotPolicy {
        self.spot_policy.unwrap_or(SpotPolicy::Auto)
    }

    pub fn pool_name(&self) -> &str {
        self.pool_name.as_deref().unwrap_or(DEFAULT_POOL_NAME)
    }

    pub fn termination_idle_time(&self) -> Duration {
        self.termination_idle_time
            .unwrap_or(DEFAULT_TERMINATION_IDLE_TIME)
    }
}
