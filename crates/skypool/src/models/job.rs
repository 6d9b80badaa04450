//! Jobs and the job state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::instance::JobProvisioningData;
use crate::models::resources::Requirements;

/// Job lifecycle.
///
/// ```text
/// SUBMITTED ──► PROVISIONING ──► PULLING ──► RUNNING ──► TERMINATING ──► TERMINATED
///     │             │                                        │              ABORTED
///     │             └──► PENDING ──► (resubmitted) ──► SUBMITTED
///     └──► FAILED / DONE reached from the stages that can produce them
/// ```
///
/// `PENDING` is the retry-active holding state: provisioning failed but the
/// run's retry window has not elapsed, so the scheduler resubmits the job on
/// a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Pending,
    Provisioning,
    Pulling,
    Running,
    Terminating,
    Terminated,
    Aborted,
    Failed,
    Done,
}

impl JobStatus {
    /// Terminal statuses: the job owns no instance and is never reprocessed.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Terminated | JobStatus::Aborted | JobStatus::Failed | JobStatus::Done
        )
    }

    /// Whether `self -> next` is a legal edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Submitted, Provisioning | Pending | Failed | Terminating) => true,
            // Resubmission while the retry window holds, or giving up.
            (Pending, Submitted | Failed | Terminating) => true,
            (Provisioning, Pulling | Pending | Failed | Terminating) => true,
            (Pulling, Running | Pending | Failed | Terminating) => true,
            (Running, Done | Failed | Pending | Terminating) => true,
            (Terminating, Terminated | Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Pending => "pending",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Pulling => "pulling",
            JobStatus::Running => "running",
            JobStatus::Terminating => "terminating",
            JobStatus::Terminated => "terminated",
            JobStatus::Aborted => "aborted",
            JobStatus::Failed => "failed",
            JobStatus::Done => "done",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "submitted" => JobStatus::Submitted,
            "pending" => JobStatus::Pending,
            "provisioning" => JobStatus::Provisioning,
            "pulling" => JobStatus::Pulling,
            "running" => JobStatus::Running,
            "terminating" => JobStatus::Terminating,
            "terminated" => JobStatus::Terminated,
            "aborted" => JobStatus::Aborted,
            "failed" => JobStatus::Failed,
            "done" => JobStatus::Done,
            other => anyhow::bail!("unknown job status: {other}"),
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `FAILED` (or terminated abnormally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    FailedToStartDueToNoCapacity,
    FailedToStartDueToBackendError,
    InterruptedByNoCapacity,
    InstanceTerminated,
    ContainerExitedWithError,
}

impl JobErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorCode::FailedToStartDueToNoCapacity => "failed_to_start_due_to_no_capacity",
            JobErrorCode::FailedToStartDueToBackendError => {
                "failed_to_start_due_to_backend_error"
            }
            JobErrorCode::InterruptedByNoCapacity => "interrupted_by_no_capacity",
            JobErrorCode::InstanceTerminated => "instance_terminated",
            JobErrorCode::ContainerExitedWithError => "container_exited_with_error",
        }
    }
}

impl std::str::FromStr for JobErrorCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "failed_to_start_due_to_no_capacity" => JobErrorCode::FailedToStartDueToNoCapacity,
            "failed_to_start_due_to_backend_error" => {
                JobErrorCode::FailedToStartDueToBackendError
            }
            "interrupted_by_no_capacity" => JobErrorCode::InterruptedByNoCapacity,
            "instance_terminated" => JobErrorCode::InstanceTerminated,
            "container_exited_with_error" => JobErrorCode::ContainerExitedWithError,
            other => anyhow::bail!("unknown job error code: {other}"),
        })
    }
}

/// Gateway placement hint carried by `service` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayHint {
    pub hostname: String,
    pub public_port: u16,
    pub secure: bool,
}

/// Everything the agent needs to start one container, plus the matching
/// input for the scheduler. Persisted as a serialized blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub job_num: u32,
    pub job_name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// A job row: one container submission within a run.
///
/// Resubmission reuses the row, bumping `submission_num`; the invariant is
/// `submission_num == number of prior submissions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub project: String,
    pub run_id: Uuid,
    pub run_name: String,
    pub job_num: u32,
    pub submission_num: u32,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub error_code: Option<JobErrorCode>,
    pub provisioning_data: Option<JobProvisioningData>,
    /// Set by a hard abort so the terminating loop picks `ABORTED` over
    /// `TERMINATED`.
    pub aborted: bool,
    pub submitted_at: DateTime<Utc>,
    /// Last successful round-trip to the on-host agent. The grace windows
    /// for unreachable hosts are measured from here.
    pub last_contact_at: Option<DateTime<Utc>>,
    pub last_processed_at: DateTime<Utc>,
}

impl JobRecord {
    /// Prepare the row for another submission after a retriable failure.
    pub fn resubmit(&mut self, now: DateTime<Utc>) {
        self.submission_num += 1;
        self.status = JobStatus::Submitted;
        self.error_code = None;
        self.provisioning_data = None;
        self.last_contact_at = None;
        self.last_processed_at = now;
    }
}
