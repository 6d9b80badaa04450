//! Instances, offers, and the data that survives a provisioning call.
//!
//! An [`Offer`] is ephemeral: it exists for the duration of one scheduling
//! decision, except for the copy frozen onto the [`InstanceRecord`] that was
//! launched from it. [`JobProvisioningData`] is the durable merge of the
//! offer and what the backend reported back, and is the only thing later
//! loops need to reach the host again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendType;
use crate::models::profile::TerminationPolicy;
use crate::models::resources::Resources;

/// Lifecycle of a provisioned cloud VM.
///
/// ```text
/// PENDING ──► CREATING ──► STARTING ──► READY ──► BUSY ◄──► IDLE
///                                                   │         │
///                                                   ▼         ▼
///                                              TERMINATING ──► TERMINATED
/// ```
///
/// Any non-terminal status may additionally jump to `TERMINATING` on an
/// explicit destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Creating,
    Starting,
    Ready,
    Busy,
    Idle,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }

    /// Whether `self -> next` is a legal edge of the instance state machine.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self == next {
            return false;
        }
        // Explicit destroy is always allowed while the instance still exists.
        if next == Terminating {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Creating)
                | (Creating, Starting)
                | (Starting, Ready)
                | (Ready, Busy)
                | (Busy, Idle)
                | (Idle, Busy)
                | (Terminating, Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => InstanceStatus::Pending,
            "creating" => InstanceStatus::Creating,
            "starting" => InstanceStatus::Starting,
            "ready" => InstanceStatus::Ready,
            "busy" => InstanceStatus::Busy,
            "idle" => InstanceStatus::Idle,
            "terminating" => InstanceStatus::Terminating,
            "terminated" => InstanceStatus::Terminated,
            other => anyhow::bail!("unknown instance status: {other}"),
        })
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-reported availability of an offer at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Available,
    NotAvailable,
    NoQuota,
}

impl Availability {
    /// `Unknown` counts as available: backends that cannot answer the
    /// question should not have their whole catalog filtered out.
    pub fn is_available(self) -> bool {
        matches!(self, Availability::Unknown | Availability::Available)
    }
}

/// A named instance type with its hardware inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceType {
    pub name: String,
    pub resources: Resources,
}

/// A priced, concrete opportunity to launch `instance_type` in `region` on
/// `backend` right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Offer {
    pub backend: BackendType,
    pub instance_type: InstanceType,
    pub region: String,
    pub spot: bool,
    pub price: f64,
    pub availability: Availability,
}

/// What a backend reports after successfully launching a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchedInstanceInfo {
    pub instance_id: String,
    pub hostname: String,
    pub region: String,
    pub username: String,
    pub ssh_port: u16,
    pub dockerized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<String>,
}

/// Durable provisioning record: the frozen offer merged with the launch
/// report. Persisted as a serialized blob on both the job and the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobProvisioningData {
    pub backend: BackendType,
    pub instance_type: InstanceType,
    pub instance_id: String,
    pub hostname: String,
    pub region: String,
    pub price: f64,
    pub username: String,
    pub ssh_port: u16,
    pub dockerized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
}

impl JobProvisioningData {
    /// Merge an offer with the backend's launch report.
    pub fn from_launch(offer: &Offer, info: LaunchedInstanceInfo, pool_id: Uuid) -> Self {
        Self {
            backend: offer.backend,
            instance_type: offer.instance_type.clone(),
            instance_id: info.instance_id,
            hostname: info.hostname,
            region: info.region,
            price: offer.price,
            username: info.username,
            ssh_port: info.ssh_port,
            dockerized: info.dockerized,
            backend_data: info.backend_data,
            pool_id: Some(pool_id),
        }
    }
}

/// A provisioned cloud VM tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub project: String,
    pub pool_id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    /// The offer this instance was launched from, frozen at launch time.
    pub offer: Offer,
    pub provisioning_data: JobProvisioningData,
    pub termination_policy: TerminationPolicy,
    #[serde(with = "humantime_serde")]
    pub termination_idle_time: Duration,
    pub backend: BackendType,
    pub region: String,
    pub price: f64,
    /// Back-reference to the owning job; `Some` iff status is `BUSY`.
    pub job_id: Option<Uuid>,
    /// Set when entering `IDLE`, cleared when leaving it.
    pub idle_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// How long this instance has been idle, if it is.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.idle_since.map(|since| now - since)
    }
}
