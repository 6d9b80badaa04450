//! The `Compute` capability: what the core needs from a cloud backend.
//!
//! Backend adapters (the actual SDK plumbing) live outside this crate; the
//! control plane only ever talks to `dyn Compute` resolved from a
//! [`BackendRegistry`]. Adapters report failures as [`BackendError`] so the
//! provisioner can tell "try the next offer" from "stop provisioning".

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::models::instance::{JobProvisioningData, LaunchedInstanceInfo, Offer};
use crate::models::job::JobSpec;
use crate::models::resources::Requirements;
use crate::models::run::RunSpec;

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Aws,
    Azure,
    Gcp,
    Lambda,
    Local,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Aws => "aws",
            BackendType::Azure => "azure",
            BackendType::Gcp => "gcp",
            BackendType::Lambda => "lambda",
            BackendType::Local => "local",
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "aws" => BackendType::Aws,
            "azure" => BackendType::Azure,
            "gcp" => BackendType::Gcp,
            "lambda" => BackendType::Lambda,
            "local" => BackendType::Local,
            other => anyhow::bail!("unknown backend: {other}"),
        })
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-side view of a launch request, used to reconcile jobs whose host
/// the agent can no longer reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Provisioning,
    Running,
    NoCapacity,
    Terminated,
}

/// SSH material injected into launched instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeys {
    pub public: String,
    pub private: String,
}

/// Instance launch parameters for the fleet path, where there is no job yet.
#[derive(Debug, Clone)]
pub struct InstanceConfiguration {
    pub instance_name: String,
    pub pool_name: String,
    pub ssh_keys: SshKeys,
}

/// Uniform compute surface per backend.
///
/// Every method is a remote call and may take seconds; callers wrap them in
/// the timeouts mandated by the scheduler configuration. `terminate_instance`
/// must be idempotent: terminating an already-gone instance is a no-op.
#[async_trait]
pub trait Compute: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Priced offers currently matching the requirements.
    async fn get_offers(&self, requirements: &Requirements) -> Result<Vec<Offer>, BackendError>;

    /// Launch a VM for the job and start the on-host agent.
    async fn run_job(
        &self,
        run: &RunSpec,
        job: &JobSpec,
        offer: &Offer,
        ssh_keys: &SshKeys,
    ) -> Result<LaunchedInstanceInfo, BackendError>;

    /// Launch a bare pool instance (fleet path): no job attached yet.
    async fn create_instance(
        &self,
        project: &str,
        offer: &Offer,
        config: &InstanceConfiguration,
    ) -> Result<LaunchedInstanceInfo, BackendError>;

    /// Tear down the VM behind the provisioning data. Idempotent.
    async fn terminate_instance(&self, data: &JobProvisioningData) -> Result<(), BackendError>;

    /// Backend-side status of the launch request.
    async fn get_request_head(
        &self,
        data: &JobProvisioningData,
    ) -> Result<RequestStatus, BackendError>;
}

/// Registry of active backend adapters, looked up by [`BackendType`].
#[derive(Default)]
pub struct BackendRegistry {
    adapters: DashMap<BackendType, Arc<dyn Compute>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same backend.
    pub fn register(&self, adapter: Arc<dyn Compute>) {
        self.adapters.insert(adapter.backend_type(), adapter);
    }

    pub fn get(&self, backend: BackendType) -> Option<Arc<dyn Compute>> {
        self.adapters.get(&backend).map(|entry| entry.value().clone())
    }

    /// Adapters for the given backends, in the given order, skipping any
    /// that have no registered adapter.
    pub fn resolve(&self, backends: &[BackendType]) -> Vec<Arc<dyn Compute>> {
        backends.iter().filter_map(|b| self.get(*b)).collect()
    }

    /// All registered backend types, sorted for determinism.
    pub fn types(&self) -> Vec<BackendType> {
        let mut types: Vec<BackendType> =
            self.adapters.iter().map(|entry| *entry.key()).collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.types())
            .finish()
    }
}
