//! Scheduler configuration: tick cadence and the mandatory per-operation
//! timeouts.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of every control loop.
    pub tick: Duration,
    /// Per-backend timeout on offer queries.
    pub offer_query_timeout: Duration,
    /// Timeout on `run_job` / `create_instance`.
    pub launch_timeout: Duration,
    /// Timeout on one agent round-trip.
    pub agent_timeout: Duration,
    /// Timeout on `terminate_instance`.
    pub terminate_timeout: Duration,
    /// How long a graceful stop may take before the instance is destroyed.
    pub stop_grace: Duration,
    /// How long an agent may be unreachable in `PULLING`/`RUNNING` before
    /// the instance is declared lost.
    pub unreachable_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(4),
            offer_query_timeout: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(120),
            agent_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(30),
            unreachable_grace: Duration::from_secs(10 * 60),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SKYPOOL_*` environment variables, all in
    /// seconds.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for (var, slot) in [
            ("SKYPOOL_TICK_SECS", &mut config.tick),
            ("SKYPOOL_OFFER_QUERY_TIMEOUT_SECS", &mut config.offer_query_timeout),
            ("SKYPOOL_LAUNCH_TIMEOUT_SECS", &mut config.launch_timeout),
            ("SKYPOOL_AGENT_TIMEOUT_SECS", &mut config.agent_timeout),
            ("SKYPOOL_TERMINATE_TIMEOUT_SECS", &mut config.terminate_timeout),
            ("SKYPOOL_STOP_GRACE_SECS", &mut config.stop_grace),
            ("SKYPOOL_UNREACHABLE_GRACE_SECS", &mut config.unreachable_grace),
        ] {
            if let Ok(value) = env::var(var) {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("{var} must be a number of seconds"))?;
                *slot = Duration::from_secs(secs);
            }
        }
        Ok(config)
    }
}
