//! The on-host agent capability.
//!
//! Every launched instance runs an agent the control plane reaches over
//! SSH/HTTP. The transport is a collaborator; the loops only need these
//! three questions answered. An `Err` from any method means the host is
//! unreachable — the running loop applies the grace-window policy before
//! declaring the instance lost.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::instance::JobProvisioningData;

/// Container state as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentJobStatus {
    /// Image pull / environment setup still in progress.
    Pulling,
    Running,
    /// Container exited with code 0.
    Done,
    /// Container exited with a non-zero code.
    Exited(i32),
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Cheap reachability probe, used while an instance is starting.
    async fn healthcheck(&self, data: &JobProvisioningData) -> Result<()>;

    /// Status of the job container on the host.
    async fn job_status(&self, data: &JobProvisioningData) -> Result<AgentJobStatus>;

    /// Ask the agent to stop the job gracefully.
    async fn stop_job(&self, data: &JobProvisioningData) -> Result<()>;
}
