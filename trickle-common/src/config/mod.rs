//! Configuration shared by the scheduler and the queue processor.
//!
//! [`SendingConfig`] is a plain snapshot: the long running loops take a copy
//! at the top of each tick and pass it down, so a reload never changes the
//! flags half way through a batch.

use serde::{Deserialize, Serialize};

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn scheduler_batch_size() -> usize {
        50
    }

    pub const fn processor_batch_size() -> usize {
        100
    }

    pub const fn stuck_timeout_minutes() -> u64 {
        15
    }

    pub const fn job_retention_days() -> u64 {
        30
    }

    pub const fn log_retention_days() -> u64 {
        90
    }
}

/// Flags and limits consumed by a single scheduler or processor tick.
///
/// # Example
///
/// ```ron
/// sending: (
///     max_attempts: 3,
///     demo_mode: false,
///     pause_all_sending: false,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Operator switches are independent on/off flags"
)]
pub struct SendingConfig {
    /// Failed deliveries allowed before a job is dead-lettered
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Subscribers examined per scheduler tick
    #[serde(default = "defaults::scheduler_batch_size")]
    pub scheduler_batch_size: usize,

    /// Jobs claimed per processor tick
    #[serde(default = "defaults::processor_batch_size")]
    pub processor_batch_size: usize,

    /// Cancel every claimed job instead of handing it to the transport
    #[serde(default)]
    pub demo_mode: bool,

    /// Make processor ticks a no-op until cleared
    #[serde(default)]
    pub pause_all_sending: bool,

    /// Skip drip content for subscribers who have not confirmed re-consent
    #[serde(default)]
    pub reconsent_required: bool,

    /// Claims older than this are considered abandoned and released
    #[serde(default = "defaults::stuck_timeout_minutes")]
    pub stuck_timeout_minutes: u64,

    /// Age after which sent and cancelled jobs are purged (0 keeps them forever)
    #[serde(default = "defaults::job_retention_days")]
    pub job_retention_days: u64,

    /// Age after which email log rows are purged (0 keeps them forever)
    #[serde(default = "defaults::log_retention_days")]
    pub log_retention_days: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            scheduler_batch_size: defaults::scheduler_batch_size(),
            processor_batch_size: defaults::processor_batch_size(),
            demo_mode: false,
            pause_all_sending: false,
            reconsent_required: false,
            stuck_timeout_minutes: defaults::stuck_timeout_minutes(),
            job_retention_days: defaults::job_retention_days(),
            log_retention_days: defaults::log_retention_days(),
        }
    }
}

impl SendingConfig {
    #[must_use]
    pub fn stuck_timeout(&self) -> chrono::Duration {
        i64::try_from(self.stuck_timeout_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// `None` when job retention is disabled.
    #[must_use]
    pub fn job_retention(&self) -> Option<chrono::Duration> {
        days(self.job_retention_days)
    }

    /// `None` when log retention is disabled.
    #[must_use]
    pub fn log_retention(&self) -> Option<chrono::Duration> {
        days(self.log_retention_days)
    }
}

fn days(value: u64) -> Option<chrono::Duration> {
    if value == 0 {
        return None;
    }
    i64::try_from(value).ok().and_then(chrono::Duration::try_days)
}
