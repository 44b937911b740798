//! Retry policy for delivery attempts.
//!
//! The attempt budget comes from the per-tick [`SendingConfig`] snapshot; the
//! spacing between attempts is a [`BackoffStrategy`] from the processor
//! configuration. Keeping them together here lets the processor ask one
//! question ("retry, and when?") without knowing how either is computed.
//!
//! [`SendingConfig`]: trickle_common::SendingConfig

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long to wait before the next attempt.
///
/// # Examples
///
/// ```ron
/// backoff: Exponential(
///     base_delay_secs: 300,
///     max_delay_secs: 86400,
///     jitter_factor: 0.1,
/// )
/// ```
///
/// ```ron
/// backoff: Fixed(delay_secs: 600)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// The same delay after every failure
    Fixed {
        #[serde(default = "defaults::fixed_delay_secs")]
        delay_secs: u64,
    },

    /// `base * 2^(attempt - 1)`, capped at `max`, randomised by ±`jitter_factor`
    Exponential {
        #[serde(default = "defaults::base_delay_secs")]
        base_delay_secs: u64,
        #[serde(default = "defaults::max_delay_secs")]
        max_delay_secs: u64,
        #[serde(default = "defaults::jitter_factor")]
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next attempt, given the number of failed attempts so
    /// far (1 after the first failure).
    #[must_use]
    pub fn delay(&self, attempt_count: u32) -> Duration {
        match *self {
            Self::Fixed { delay_secs } => Duration::from_secs(delay_secs),
            Self::Exponential {
                base_delay_secs,
                max_delay_secs,
                jitter_factor,
            } => {
                let exponent = attempt_count.saturating_sub(1);
                let delay = if exponent >= 63 {
                    max_delay_secs
                } else {
                    base_delay_secs
                        .saturating_mul(1u64 << exponent)
                        .min(max_delay_secs)
                };

                Duration::from_secs(jittered(delay, jitter_factor))
            }
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn jittered(delay: u64, jitter_factor: f64) -> u64 {
    let jitter_range = (delay as f64) * jitter_factor.clamp(0.0, 1.0);
    if jitter_range <= 0.0 {
        return delay;
    }

    let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
    ((delay as f64) + jitter).max(0.0) as u64
}

/// Retry decisions for one processor tick.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts allowed before a job is dead-lettered
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Whether a job that has now failed `attempt_count` times gets another go.
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempt_count: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt_count)
    }

    /// When a job that has now failed `attempt_count` times should run again.
    #[must_use]
    pub fn next_attempt_at(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff.delay(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn fixed_delay_secs() -> u64 {
        600 // 10 minutes
    }

    pub const fn base_delay_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn max_delay_secs() -> u64 {
        86400 // 24 hours
    }

    pub const fn jitter_factor() -> f64 {
        0.1 // ±10%
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn exponential(base: u64, max: u64) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            base_delay_secs: base,
            max_delay_secs: max,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(3, BackoffStrategy::default());

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));

        assert_eq!(policy.remaining_attempts(1), 2);
        assert_eq!(policy.remaining_attempts(5), 0);
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = exponential(60, 86400);
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
        assert_eq!(backoff.delay(0), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = exponential(60, 300);
        assert_eq!(backoff.delay(4), Duration::from_secs(300));
        assert_eq!(backoff.delay(100), Duration::from_secs(300));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = BackoffStrategy::Exponential {
            base_delay_secs: 1000,
            max_delay_secs: 86400,
            jitter_factor: 0.2,
        };

        for _ in 0..100 {
            let secs = backoff.delay(1).as_secs();
            assert!((800..=1200).contains(&secs), "delay {secs} out of range");
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed { delay_secs: 90 };
        assert_eq!(backoff.delay(1), Duration::from_secs(90));
        assert_eq!(backoff.delay(7), Duration::from_secs(90));
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = RetryPolicy::new(3, exponential(300, 86400));
        let now = Utc::now();
        assert_eq!(
            policy.next_attempt_at(2, now) - now,
            chrono::Duration::minutes(10)
        );
    }

    #[test]
    fn test_parse_backoff() {
        let backoff: BackoffStrategy =
            ron::from_str("Fixed(delay_secs: 30)").expect("Failed to parse fixed backoff");
        assert_eq!(backoff, BackoffStrategy::Fixed { delay_secs: 30 });

        let backoff: BackoffStrategy =
            ron::from_str("Exponential(base_delay_secs: 10)").expect("Failed to parse backoff");
        assert_eq!(
            backoff,
            BackoffStrategy::Exponential {
                base_delay_secs: 10,
                max_delay_secs: 86400,
                jitter_factor: 0.1,
            }
        );
    }
}
