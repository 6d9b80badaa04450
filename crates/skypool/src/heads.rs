//! Head objects: compact summaries on a durable key-value store.
//!
//! Listing runs must not require deserializing every run spec, so each
//! committed job transition also writes a small [`RunHead`] blob. The store
//! offers at-least-once list consistency; readers tolerate a head that is
//! one transition behind.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::run::RunHead;

#[async_trait]
pub trait HeadStore: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    /// Keys under the prefix. At-least-once: a key may appear although its
    /// object was deleted concurrently.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub fn run_head_key(project: &str, run_name: &str) -> String {
    format!("runs/{project}/{run_name}")
}

/// Serialize and store a run head under its canonical key.
pub async fn put_run_head(heads: &dyn HeadStore, head: &RunHead) -> Result<()> {
    let key = run_head_key(&head.project, &head.run_name);
    heads.put(&key, serde_json::to_value(head)?).await
}

/// Load a run head back, if present.
pub async fn get_run_head(
    heads: &dyn HeadStore,
    project: &str,
    run_name: &str,
) -> Result<Option<RunHead>> {
    let Some(value) = heads.get(&run_head_key(project, run_name)).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_value(value)?))
}
