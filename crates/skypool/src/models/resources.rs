//! Hardware inventory and requirement matching.
//!
//! `Resources` describes what an instance type physically has; `Requirements`
//! describes what a job asks for. Matching is a plain predicate so the offer
//! aggregator and the pool manager apply the exact same rules.

use serde::{Deserialize, Serialize};

/// A single GPU on an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Gpu {
    pub name: String,
    pub memory_mib: u64,
    /// CUDA compute capability as `"major.minor"`, when the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
}

/// Hardware inventory of an instance type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub gpus: Vec<Gpu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_mib: Option<u64>,
}

/// GPU portion of a job's requirements.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpusRequirements {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_memory_mib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
}

/// What a job asks for. Every field is optional; an empty requirements block
/// matches anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<GpusRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size_mib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    /// `Some(true)` = spot only, `Some(false)` = on-demand only, `None` = both.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<bool>,
}

impl Resources {
    /// True when this inventory can host a job with the given requirements.
    pub fn satisfies(&self, req: &Requirements) -> bool {
        if let Some(cpus) = req.cpus {
            if self.cpus < cpus {
                return false;
            }
        }
        if let Some(memory_mib) = req.memory_mib {
            if self.memory_mib < memory_mib {
                return false;
            }
        }
        if let Some(gpus) = &req.gpus {
            if !self.satisfies_gpus(gpus) {
                return false;
            }
        }
        true
    }

    fn satisfies_gpus(&self, req: &GpusRequirements) -> bool {
        let matching: Vec<&Gpu> = self
            .gpus
            .iter()
            .filter(|gpu| {
                if let Some(name) = &req.name {
                    if !gpu.name.eq_ignore_ascii_case(name) {
                        return false;
                    }
                }
                if let Some(memory_mib) = req.memory_mib {
                    if gpu.memory_mib < memory_mib {
                        return false;
                    }
                }
                if let Some(cc) = &req.compute_capability {
                    match (parse_compute_capability(cc), gpu_capability(gpu)) {
                        (Some(want), Some(have)) if have >= want => {}
                        _ => return false,
                    }
                }
                true
            })
            .collect();
        if (matching.len() as u32) < req.count {
            return false;
        }
        if let Some(total) = req.total_memory_mib {
            let sum: u64 = matching.iter().map(|gpu| gpu.memory_mib).sum();
            if sum < total {
                return false;
            }
        }
        true
    }
}

fn gpu_capability(gpu: &Gpu) -> Option<(u8, u8)> {
    gpu.compute_capability
        .as_deref()
        .and_then(parse_compute_capability)
}

fn parse_compute_capability(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}
