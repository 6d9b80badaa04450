//! Runs: the user-submitted unit of work.
//!
//! The wire format of a run is a [`RunSpec`] whose `configuration` is a
//! tagged union over `type`. Unknown variants and unknown fields are
//! rejected at parse time, so a blob that round-trips once will round-trip
//! forever.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobErrorCode, JobRecord, JobStatus};
use crate::models::profile::Profile;
use crate::models::resources::Requirements;

/// Reference to the repository a run executes against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoRef {
    pub repo_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// IDE launched inside a dev environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ide {
    Vscode,
}

/// Model endpoint descriptor for `service` runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevEnvironmentConfig {
    pub ide: Ide,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub resources: Requirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub resources: Requirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub resources: Requirements,
}

/// What kind of workload a run is, with the variant-specific required
/// fields. Serde strips the `type` tag before handing the remaining fields
/// to the variant struct, so `deny_unknown_fields` still applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunConfiguration {
    #[serde(rename = "dev-environment")]
    DevEnvironment(DevEnvironmentConfig),
    #[serde(rename = "task")]
    Task(TaskConfig),
    #[serde(rename = "service")]
    Service(ServiceConfig),
}

impl RunConfiguration {
    pub fn kind(&self) -> &'static str {
        match self {
            RunConfiguration::DevEnvironment(_) => "dev-environment",
            RunConfiguration::Task(_) => "task",
            RunConfiguration::Service(_) => "service",
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, RunConfiguration::Service(_))
    }

    pub fn resources(&self) -> &Requirements {
        match self {
            RunConfiguration::DevEnvironment(config) => &config.resources,
            RunConfiguration::Task(config) => &config.resources,
            RunConfiguration::Service(config) => &config.resources,
        }
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            RunConfiguration::DevEnvironment(config) => config.image.as_deref(),
            RunConfiguration::Task(config) => config.image.as_deref(),
            RunConfiguration::Service(config) => config.image.as_deref(),
        }
    }
}

/// The immutable document a run is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    pub configuration: RunConfiguration,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoRef>,
}

/// A run row. Never physically deleted; `deleted` tombstones it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub project: String,
    pub run_name: String,
    pub spec: RunSpec,
    pub submitted_at: DateTime<Utc>,
    /// Whether the run's service jobs are currently registered with the
    /// gateway. Only meaningful for `service` runs.
    pub gateway_registered: bool,
    pub deleted: bool,
}

/// Assembled run view: the record plus its jobs and derived fields.
#[derive(Debug, Clone)]
pub struct Run {
    pub record: RunRecord,
    pub jobs: Vec<JobRecord>,
    pub status: JobStatus,
    pub cost: f64,
    pub service: Option<ServiceInfo>,
}

/// Where a `service` run is reachable once running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ServiceModelInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceModelInfo {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Compact summary written to the head store after every committed job
/// transition, so list operations never deserialize full specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHead {
    pub run_name: String,
    pub project: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<JobErrorCode>,
    pub cost: f64,
}

/// Derive a run's status from its jobs: the first non-terminal job's status,
/// else the last job's. Jobs must be ordered by `job_num`.
pub fn run_status(jobs: &[JobRecord]) -> JobStatus {
    let Some(last) = jobs.last() else {
        return JobStatus::Submitted;
    };
    jobs.iter()
        .find(|job| !job.status.is_finished())
        .unwrap_or(last)
        .status
}

/// Accumulated cost of a run: instance price times wall time, summed over
/// the jobs that actually reached an instance.
pub fn run_cost(jobs: &[JobRecord], now: DateTime<Utc>) -> f64 {
    let total: f64 = jobs
        .iter()
        .filter_map(|job| {
            let data = job.provisioning_data.as_ref()?;
            let end = if job.status.is_finished() {
                job.last_processed_at
            } else {
                now
            };
            let hours = (end - job.submitted_at).num_seconds().max(0) as f64 / 3600.0;
            Some(data.price * hours)
        })
        .sum();
    (total * 10_000.0).round() / 10_000.0
}

/// Derive the externally visible service endpoint for a `service` run from
/// the gateway hint on its first job.
pub fn service_info(spec: &RunSpec, jobs: &[JobRecord]) -> Option<ServiceInfo> {
    let RunConfiguration::Service(config) = &spec.configuration else {
        return None;
    };
    let gateway = jobs.first()?.spec.gateway.as_ref()?;
    let scheme = if gateway.secure { "https" } else { "http" };
    let omit_port = (gateway.secure && gateway.public_port == 443)
        || (!gateway.secure && gateway.public_port == 80);
    let url = if omit_port {
        format!("{scheme}://{}", gateway.hostname)
    } else {
        format!("{scheme}://{}:{}", gateway.hostname, gateway.public_port)
    };
    let model = config.model.as_ref().and_then(|model| {
        let (_, domain) = gateway.hostname.split_once('.')?;
        Some(ServiceModelInfo {
            name: model.name.clone(),
            base_url: format!("https://gateway.{domain}"),
            kind: model.kind.clone(),
        })
    });
    Some(ServiceInfo { url, model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{GatewayHint, JobSpec};

    fn job(job_num: u32, status: JobStatus) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: Uuid::new_v4(),
            project: "acme".to_string(),
            run_id: Uuid::new_v4(),
            run_name: "web-1".to_string(),
            job_num,
            submission_num: 0,
            spec: JobSpec {
                job_num,
                job_name: format!("web-1-{job_num}"),
                image: "nginx".to_string(),
                entrypoint: None,
                commands: vec![],
                env: BTreeMap::new(),
                ports: vec![],
                requirements: Requirements::default(),
                gateway: Some(GatewayHint {
                    hostname: "web-1.apps.example.com".to_string(),
                    public_port: 443,
                    secure: true,
                }),
                pool_name: None,
                working_dir: None,
            },
            status,
            error_code: None,
            provisioning_data: None,
            aborted: false,
            submitted_at: now,
            last_contact_at: None,
            last_processed_at: now,
        }
    }

    #[test]
    fn configuration_is_discriminated_on_type() {
        let task: RunConfiguration =
            serde_json::from_str(r#"{"type": "task", "commands": ["make"]}"#).unwrap();
        assert_eq!(task.kind(), "task");

        let dev: RunConfiguration =
            serde_json::from_str(r#"{"type": "dev-environment", "ide": "vscode"}"#).unwrap();
        assert_eq!(dev.kind(), "dev-environment");

        let service: RunConfiguration =
            serde_json::from_str(r#"{"type": "service", "port": 8000}"#).unwrap();
        assert!(service.is_service());
    }

    #[test]
    fn unknown_variant_rejected() {
        let err = serde_json::from_str::<RunConfiguration>(r#"{"type": "cron", "schedule": "*"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_field_in_variant_rejected() {
        let err =
            serde_json::from_str::<RunConfiguration>(r#"{"type": "task", "commands": [], "gpus": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn variant_required_fields_enforced() {
        // task without commands
        assert!(serde_json::from_str::<RunConfiguration>(r#"{"type": "task"}"#).is_err());
        // dev-environment without ide
        assert!(
            serde_json::from_str::<RunConfiguration>(r#"{"type": "dev-environment"}"#).is_err()
        );
        // service without port
        assert!(serde_json::from_str::<RunConfiguration>(r#"{"type": "service"}"#).is_err());
    }

    #[test]
    fn run_spec_round_trips_exactly() {
        let json = r#"{
            "run_name": "train-7",
            "configuration": {
                "type": "task",
                "commands": ["python train.py"],
                "image": "cuda:12",
                "resources": {"cpus": 4, "memory_mib": 16384}
            },
            "profile": {"spot_policy": "auto", "retry": "1h"}
        }"#;
        let spec: RunSpec = serde_json::from_str(json).unwrap();
        let reserialized = serde_json::to_string(&spec).unwrap();
        let back: RunSpec = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn run_status_first_non_terminal_wins() {
        let jobs = vec![
            job(0, JobStatus::Done),
            job(1, JobStatus::Running),
            job(2, JobStatus::Failed),
        ];
        assert_eq!(run_status(&jobs), JobStatus::Running);
    }

    #[test]
    fn run_status_all_terminal_takes_last() {
        let jobs = vec![job(0, JobStatus::Done), job(1, JobStatus::Failed)];
        assert_eq!(run_status(&jobs), JobStatus::Failed);
        assert_eq!(run_status(&[]), JobStatus::Submitted);
    }

    #[test]
    fn service_info_derives_urls() {
        let spec = RunSpec {
            run_name: Some("web-1".to_string()),
            configuration: RunConfiguration::Service(ServiceConfig {
                port: 8000,
                model: Some(ModelSpec {
                    name: "llama-70b".to_string(),
                    kind: Some("chat".to_string()),
                }),
                image: None,
                env: BTreeMap::new(),
                commands: vec![],
                resources: Requirements::default(),
            }),
            profile: Profile::default(),
            repo: None,
        };
        let jobs = vec![job(0, JobStatus::Running)];
        let info = service_info(&spec, &jobs).unwrap();
        assert_eq!(info.url, "https://web-1.apps.example.com");
        let model = info.model.unwrap();
        assert_eq!(model.base_url, "https://gateway.apps.example.com");
    }
}
