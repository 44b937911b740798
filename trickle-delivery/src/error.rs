//! Typed error handling for delivery operations.
//!
//! This module separates:
//! - Permanent failures (5xx SMTP codes, bad addresses) - dead-letter at once
//! - Temporary failures (4xx SMTP codes, timeouts) - retry with backoff
//! - System errors - the store or configuration, never the message

use std::time::Duration;

use thiserror::Error;
use trickle_store::StoreError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (storage, configuration, etc.).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Errors that no amount of retrying will fix.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is invalid or rejected by the server.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Message was rejected by the server (policy, spam, mailbox gone).
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// The message could not be built from the job.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// SMTP authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

/// Errors worth another attempt later.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to reach the mail server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server returned a temporary failure code.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    /// The transport did not answer in time.
    #[error("Transport timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Processor used before `init()`.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Returns `true` if another processor already moved the job on.
    #[must_use]
    pub const fn is_lost_race(&self) -> bool {
        matches!(self, Self::System(SystemError::Store(e)) if e.is_lost_race())
    }
}

impl From<StoreError> for DeliveryError {
    fn from(e: StoreError) -> Self {
        Self::System(SystemError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use trickle_common::JobId;
    use trickle_common::JobStatus;

    use super::*;

    #[test]
    fn test_error_classification() {
        let permanent: DeliveryError =
            PermanentError::InvalidRecipient("nobody@invalid".to_string()).into();
        assert!(permanent.is_permanent());
        assert!(!permanent.is_temporary());

        let temporary: DeliveryError = TemporaryError::Timeout(Duration::from_secs(30)).into();
        assert!(temporary.is_temporary());
        assert_eq!(
            temporary.to_string(),
            "Temporary failure: Transport timed out after 30s"
        );

        let system: DeliveryError = StoreError::Validation("bad".to_string()).into();
        assert!(system.is_system());
        assert!(!system.is_lost_race());
    }

    #[test]
    fn test_lost_race_passes_through() {
        let err: DeliveryError = StoreError::InvalidTransition {
            job: JobId(1),
            expected: "processing",
            found: JobStatus::Sent,
        }
        .into();
        assert!(err.is_lost_race());
    }
}
