use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::network::NetworkRequirement;

/// Why a constraint refused a job. Always terminal, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("deadline {deadline} has passed")]
    DeadlinePassed { deadline: DateTime<Utc> },

    #[error("a job with uuid {uuid} is already queued")]
    DuplicateJob { uuid: String },

    #[error("network unavailable (requires {required})")]
    NetworkUnavailable { required: NetworkRequirement },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// An admission check failed at schedule time or before a run attempt.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[from] ConstraintError),

    /// The job body reported a failure through its completion.
    #[error("Execution failed: {message}")]
    Execution { message: String },

    /// The retry handler declined to retry; wraps the failure it was shown.
    #[error("Retry cancelled after: {0}")]
    RetryCancelled(Box<JobError>),

    /// Cancelled from outside the engine.
    #[error("Job cancelled")]
    Cancelled,

    /// Rejected at submission before any constraint ran.
    #[error("Invalid job record: {0}")]
    InvalidRecord(String),
}

impl JobError {
    pub fn execution(message: impl Into<String>) -> Self {
        JobError::Execution {
            message: message.into(),
        }
    }

    /// Short stable code, suitable for logs and persisted audit trails.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::ConstraintViolation(ConstraintError::DeadlinePassed { .. }) => {
                "DEADLINE_PASSED"
            }
            JobError::ConstraintViolation(ConstraintError::DuplicateJob { .. }) => "DUPLICATE_JOB",
            JobError::ConstraintViolation(ConstraintError::NetworkUnavailable { .. }) => {
                "NETWORK_UNAVAILABLE"
            }
            JobError::Execution { .. } => "EXECUTION_FAILED",
            JobError::RetryCancelled(_) => "RETRY_CANCELLED",
            JobError::Cancelled => "CANCELLED",
            JobError::InvalidRecord(_) => "INVALID_RECORD",
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, JobError::ConstraintViolation(_))
    }
}

/// Final result carried by the single remove notification of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Fail(JobError),
}

impl JobOutcome {
    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Success => None,
            JobOutcome::Fail(e) => Some(e),
        }
    }
}

/// Decoding a flat persisted record failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);
