//! Structured error types for the control plane.
//!
//! Two families cross component boundaries:
//!
//! - [`ClientError`] — the caller got something wrong. Surfaced verbatim to
//!   the API collaborator and never converted into an instance state change.
//! - [`BackendError`] — a cloud backend call failed. The retriable/fatal
//!   split decides whether the provisioner falls through to the next offer
//!   or aborts the attempt and records the failure on the job.
//!
//! Everything else travels as `anyhow::Error` inside the loops, which log
//! and swallow retriable conditions; `anyhow` never escapes to callers of
//! the service layer without one of the structured types attached.

use std::time::Duration;

use thiserror::Error;

/// Validation and precondition failures. Never triggers provisioning
/// side effects.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid run spec: {0}")]
    InvalidRunSpec(String),

    #[error("no backends configured for project {0}")]
    NoBackends(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("cannot delete active runs: {0:?}")]
    RunsActive(Vec<String>),

    #[error("pool {0} not found")]
    PoolNotFound(String),

    #[error("pool {0} still has instances")]
    PoolInUse(String),
}

/// Failure reported by a backend adapter.
///
/// Retriable variants cause fall-through to the next offer (or the next
/// tick); fatal variants abort the provisioning attempt for the job.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether the next offer (or the next tick) may plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BackendError::NoCapacity(_)
                | BackendError::QuotaExceeded(_)
                | BackendError::Transient(_)
                | BackendError::Timeout(_)
        )
    }
}
