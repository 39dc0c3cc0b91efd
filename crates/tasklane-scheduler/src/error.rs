use tasklane_core::RecordError;
use thiserror::Error;

/// Errors raised by the scheduler's storage and rehydration paths.
///
/// Job lifecycle failures are not errors of this kind: they travel to the
/// job's remove notification as a [`tasklane_core::JobError`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record column is not valid JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record decoded to JSON but not to a job record.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
