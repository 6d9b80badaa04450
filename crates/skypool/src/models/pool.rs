//! Pools: named instance sets inside a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pool row. An instance belongs to exactly one pool; deleting a pool
/// that still has live instances is rejected at the store level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: Uuid,
    pub project: String,
    pub name: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn new(project: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            name: name.into(),
            deleted: false,
            created_at: now,
        }
    }
}
