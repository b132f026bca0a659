//! Error types for kiln.

use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Kiln error type.
///
/// Validation and not-found errors are returned synchronously and never
/// mutate registry state. Gateway errors raised while a job is being
/// driven are absorbed into the job's state machine and surface through
/// [`crate::orchestrator::Orchestrator::poll`] rather than through the
/// call that triggered them.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad model or configuration. User-correctable, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No model loaded under the given name.
    #[error("model `{0}` is not loaded")]
    ModelNotFound(String),

    /// No job registered under the given identifier.
    #[error("job `{0}` does not exist")]
    JobNotFound(JobId),

    /// Operation is illegal in the job's current lifecycle state.
    #[error("cannot {operation} job `{job_id}` in state {state}")]
    InvalidState {
        job_id: JobId,
        state: JobState,
        operation: &'static str,
    },

    /// The provisioning gateway failed to supply a backend.
    ///
    /// `transient` marks network-class failures that are eligible for a
    /// bounded number of retries before the job is failed.
    #[error("provisioning failed: {message}")]
    Provisioning { message: String, transient: bool },

    /// The deployment gateway failed to push the runtime payload.
    ///
    /// `transient` marks network-class failures that are eligible for a
    /// bounded number of retries before the job is failed.
    #[error("deployment failed: {message}")]
    Deployment { message: String, transient: bool },

    /// A configured lifecycle limit (provisioning, startup, deployment
    /// or optimization) elapsed. Drives the job to `Failed` with
    /// teardown, exactly like any other gateway failure.
    #[error("{phase} did not finish within the configured {limit_ms} ms")]
    LifecycleTimeout { phase: &'static str, limit_ms: u64 },

    /// A caller-side wait elapsed before the job reached a terminal
    /// state. Never mutates job state.
    #[error("timed out after {0:?} waiting for job to reach a terminal state")]
    WaitTimeout(Duration),
}

impl Error {
    /// Whether a retry may be worthwhile. Only network-class gateway
    /// failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Provisioning {
                transient: true,
                ..
            } | Error::Deployment {
                transient: true,
                ..
            }
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, Error>;
