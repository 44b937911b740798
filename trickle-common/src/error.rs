//! Errors raised while parsing the string forms of shared types.

use thiserror::Error;

/// A stored or configured value did not name a known variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown subscriber status: {0}")]
    SubscriberStatus(String),

    #[error("Unknown job status: {0}")]
    JobStatus(String),

    #[error("Unknown log status: {0}")]
    LogStatus(String),

    #[error("Unknown event type: {0}")]
    EventType(String),

    #[error("Unknown preference: {0}")]
    Preference(String),
}
