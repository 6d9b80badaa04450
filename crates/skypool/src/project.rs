//! Project configuration resolution.
//!
//! Which backends a project may provision on and the SSH material injected
//! into its instances come from configuration owned by the API collaborator.
//! The scheduler resolves them through this capability at claim time, so a
//! config change applies from the next tick without a restart.

use anyhow::Result;
use async_trait::async_trait;

use crate::backend::{BackendType, SshKeys};

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    /// Backends enabled for this project, in preference order.
    pub backends: Vec<BackendType>,
    pub ssh_keys: SshKeys,
}

#[async_trait]
pub trait ProjectConfigStore: Send + Sync {
    async fn get_project(&self, project: &str) -> Result<Option<ProjectConfig>>;
}
