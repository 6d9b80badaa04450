//! # Skypool
//!
//! A multi-cloud workload orchestration control plane: persisted runs and
//! jobs are driven through their state machines by periodic control loops
//! that reuse pooled instances where possible and provision fresh ones from
//! a priced, cross-backend offer list where not.
//!
//! ## Core Concepts
//!
//! Skypool separates **truth** from **work**:
//! - The relational [`store::StateStore`] = truth (every status lives there)
//! - The [`scheduler::Scheduler`] loops = work (claim, do I/O, write back)
//!
//! The key principle: **every external side effect is followed by a durable
//! write before the next step**. A crash at any point leaves records that
//! the next tick can pick up again.
//!
//! ## Architecture
//!
//! ```text
//! API collaborator
//!     │ submit / stop / delete
//!     ▼
//! RunService ──► StateStore (runs, jobs SUBMITTED)
//!                    │
//!     ┌──────────────┼──────────────────────────────┐
//!     ▼              ▼                              ▼
//! process_submitted  process_running   process_terminating
//!     │              │                              │
//!     │ pool reuse?  │ agent poll                   │ agent stop / backend kill
//!     ├─► PoolManager (CAS claim READY -> BUSY)     │
//!     │                                             │
//!     │ else: OfferAggregator ─► Provisioner        │
//!     │        (price-sorted)    (offer walk with   │
//!     │                           fall-through)     │
//!     ▼                                             ▼
//! Compute backends (AWS / GCP / Azure / ...)   instances IDLE / TERMINATED
//!                                                   ▲
//!                       process_idle_instances ─────┘ (reaper)
//!                       process_gateways ──► GatewayService
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One owner per instance** — `BUSY` instances reference exactly one
//!    non-terminal job; claiming is a CAS, never a blind write
//! 2. **One mutator per entity** — each loop's in-flight set serializes
//!    processing; ids are guard-protected and can never leak
//! 3. **Deterministic offers** — the aggregated offer list is a pure
//!    function of its inputs; equal prices break ties stably
//! 4. **Retry is a window, not a counter** — anchored at run submission,
//!    evaluated only at the scheduling step
//! 5. **Terminate is idempotent** — destroying an already-gone instance is
//!    a no-op, so every destroy path may be retried
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use skypool::{BackendRegistry, RunService, Scheduler, SchedulerConfig};
//!
//! let backends = Arc::new(BackendRegistry::new());
//! backends.register(my_aws_adapter);
//! backends.register(my_gcp_adapter);
//!
//! let scheduler = Arc::new(
//!     Scheduler::builder(store.clone(), backends.clone())
//!         .with_projects(projects.clone())
//!         .with_agent(agent)
//!         .with_gateway(gateway)
//!         .with_heads(heads)
//!         .with_config(SchedulerConfig::from_env()?)
//!         .build()?,
//! );
//! let handle = scheduler.start();
//!
//! let runs = RunService::new(store, projects);
//! runs.submit("my-project", run_spec).await?;
//! // ... the loops take it from here ...
//!
//! handle.shutdown().await;
//! ```
//!
//! ## What This Is Not
//!
//! Skypool is **not**:
//! - A REST API (the HTTP surface is a collaborator)
//! - A cloud SDK (backends implement the [`backend::Compute`] capability)
//! - A gateway dataplane (only the registration hook lives here)
//! - A multi-replica scheduler (one active process, one shared store)

// Core modules
mod config;
mod error;
mod offers;
mod provision;
mod retry;

// Capability seams (implemented by collaborators)
pub mod agent;
pub mod backend;
pub mod gateway;
pub mod heads;
pub mod project;
pub mod store;

// Entities and specs
pub mod models;

// Pool management and services
pub mod fleet;
pub mod pool;
pub mod runs;

// Control loops
pub mod scheduler;

// End-to-end scheduling scenarios live in tests/scenarios.rs, driven
// against the fakes in the skypool-testing crate.

// Re-export the configuration and error types
pub use crate::config::SchedulerConfig;
pub use crate::error::{BackendError, ClientError};

// Re-export capability surfaces
pub use crate::agent::{Agent, AgentJobStatus};
pub use crate::backend::{
    BackendRegistry, BackendType, Compute, InstanceConfiguration, RequestStatus, SshKeys,
};
pub use crate::gateway::GatewayService;
pub use crate::heads::HeadStore;
pub use crate::project::{ProjectConfig, ProjectConfigStore};
pub use crate::store::{ReleaseOutcome, StateStore};

// Re-export the model types used at every seam
pub use crate::models::instance::{
    Availability, InstanceRecord, InstanceStatus, InstanceType, JobProvisioningData,
    LaunchedInstanceInfo, Offer,
};
pub use crate::models::job::{JobErrorCode, JobRecord, JobSpec, JobStatus};
pub use crate::models::profile::{
    CreationPolicy, Profile, RetryPolicy, SpotPolicy, TerminationPolicy, DEFAULT_POOL_NAME,
};
pub use crate::models::resources::{Requirements, Resources};
pub use crate::models::run::{Run, RunConfiguration, RunHead, RunRecord, RunSpec};

// Re-export the components
pub use crate::offers::{list_offers, list_profile_offers, matches_profile, sort_offers};
pub use crate::provision::{provision_job, Provisioned, ProvisionTimeouts};
pub use crate::retry::{no_capacity_outcome, retry_active};
pub use crate::runs::RunService;
pub use crate::scheduler::{Scheduler, SchedulerBuilder, SchedulerHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
