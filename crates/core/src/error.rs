//! Domain error model.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the job state machine
/// (validation, illegal transitions). Storage concerns belong to the store
/// error type in `queuectl-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input failed validation (e.g. empty command).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition was requested from a state that does not allow it.
    #[error("invalid transition for job {job_id}: {action} requires state {expected}, found {actual}")]
    InvalidTransition {
        job_id: JobId,
        action: &'static str,
        expected: JobState,
        actual: JobState,
    },

    /// The job is processing under a different lease owner.
    #[error("lease on job {job_id} is not held by {owner}")]
    LeaseNotHeld { job_id: JobId, owner: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(
        job_id: JobId,
        action: &'static str,
        expected: JobState,
        actual: JobState,
    ) -> Self {
        Self::InvalidTransition {
            job_id,
            action,
            expected,
            actual,
        }
    }
}
