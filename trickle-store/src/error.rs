//! Error types for the trickle-store crate.

use std::io;

use thiserror::Error;
use trickle_common::{DeadLetterId, JobId, JobStatus, ParseError};

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// A conditional status transition found the job in another state.
    ///
    /// This is the expected result when another processor got there first.
    #[error("Job {job} is {found}, expected {expected}")]
    InvalidTransition {
        job: JobId,
        expected: &'static str,
        found: JobStatus,
    },

    /// The job was released and claimed again since this claim was handed out.
    #[error("Claim {generation} on job {job} is no longer held")]
    ClaimLost { job: JobId, generation: u32 },

    /// The dead letter was already put back on the queue.
    #[error("Dead letter {0} has already been requeued")]
    AlreadyRequeued(DeadLetterId),

    /// The in-memory store is full.
    #[error("Queue capacity exceeded: {used}/{capacity} jobs")]
    CapacityExceeded { used: usize, capacity: usize },

    /// A job or record failed validation before being written.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored value could not be turned back into a typed value.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O error (creating the database directory, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Returns `true` if the error means another actor already moved the row on.
    #[must_use]
    pub const fn is_lost_race(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::ClaimLost { .. } | Self::AlreadyRequeued(_)
        )
    }

    pub(crate) const fn job_not_found(id: JobId) -> Self {
        Self::NotFound {
            kind: "Job",
            id: id.get(),
        }
    }

    pub(crate) const fn dead_letter_not_found(id: DeadLetterId) -> Self {
        Self::NotFound {
            kind: "Dead letter",
            id: id.get(),
        }
    }
}

impl From<ParseError> for StoreError {
    fn from(e: ParseError) -> Self {
        Self::InvalidData(e.to_string())
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: StoreError = io_err.into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_lost_race_classification() {
        let err = StoreError::InvalidTransition {
            job: JobId(7),
            expected: "processing",
            found: JobStatus::Sent,
        };
        assert!(err.is_lost_race());
        assert_eq!(err.to_string(), "Job 7 is sent, expected processing");

        assert!(StoreError::AlreadyRequeued(DeadLetterId(3)).is_lost_race());

        let err = StoreError::ClaimLost {
            job: JobId(7),
            generation: 1,
        };
        assert!(err.is_lost_race());
        assert_eq!(err.to_string(), "Claim 1 on job 7 is no longer held");
        assert!(!StoreError::job_not_found(JobId(1)).is_lost_race());
        assert_eq!(StoreError::job_not_found(JobId(1)).to_string(), "Job 1 not found");
    }
}
