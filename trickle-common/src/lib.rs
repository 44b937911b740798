//! Types shared by every trickle crate: identifiers, subscriber and job
//! vocabularies, the per-tick sending configuration, template substitution
//! and logging setup.

pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod logging;
pub mod subscriber;
pub mod template;

pub use tracing;

pub use config::SendingConfig;
pub use error::ParseError;
pub use ids::{ContentId, DeadLetterId, JobId, SubscriberId};
pub use job::{EventType, JobStatus, LogStatus, Priority};
pub use subscriber::{Frequency, Preference, Preferences, SubscriberRecord, SubscriberStatus};

/// Lifecycle signal broadcast to the long running loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work and exit once the current tick completes
    Shutdown,
    /// Re-read configuration from disk
    Reload,
}
