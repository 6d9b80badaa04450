//! The gateway capability: service registration hooks.
//!
//! The TLS-terminating dataplane is a collaborator; the core only tells it
//! which `service` runs should be reachable. Both calls are idempotent so
//! the gateway loop can safely repeat them after a crash.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::gateway::AcmeSettings;
use crate::models::job::JobRecord;

#[async_trait]
pub trait GatewayService: Send + Sync {
    /// Expose the run's jobs behind the gateway.
    async fn register_service(
        &self,
        project: &str,
        run_name: &str,
        jobs: &[JobRecord],
    ) -> Result<()>;

    /// Stop exposing the run.
    async fn unregister_service(&self, project: &str, run_name: &str) -> Result<()>;

    /// Push ACME settings to the gateway.
    async fn set_config(&self, project: &str, settings: &AcmeSettings) -> Result<()>;
}
