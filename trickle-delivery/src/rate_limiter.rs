//! Fixed-window limit on inbound subscription attempts
//!
//! Each client identity (an IP address, an email, whatever the caller keys
//! on) gets a counter that lives for one window. Identities are hashed
//! before they reach the store so raw addresses are never persisted.
//!
//! # Example
//!
//! ```text
//! Limit: 5 per 3600s
//! - Attempts 1-5 within the hour are allowed
//! - Attempt 6 is rejected with the seconds left in the window
//! - The first attempt after the window expires starts a fresh count of 1
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use trickle_store::{BackingStore, RateLimitStore};

use crate::error::DeliveryError;

/// Configuration for subscription rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Attempts allowed per identity per window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_window_secs() -> u64 {
    3600 // 1 hour
}

impl RateLimitConfig {
    fn window(&self) -> chrono::Duration {
        i64::try_from(self.window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        /// Attempts left in the current window
        remaining: u32,
    },
    Limited {
        retry_after_secs: u64,
        /// Human readable explanation suitable for showing to the client
        message: String,
    },
}

impl RateLimitDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Store key for an identity: SHA-256 hex of the trimmed, lowercased value.
#[must_use]
pub fn rate_limit_key(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.trim().to_lowercase().as_bytes()))
}

#[derive(Debug, Clone)]
pub struct SubscriptionRateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn BackingStore>,
}

impl SubscriptionRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn BackingStore>) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count an attempt by `identity` and decide whether to let it through.
    pub async fn check(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DeliveryError> {
        let key = rate_limit_key(identity);
        let entry = self.store.hit(&key, self.config.window(), now).await?;

        if entry.attempts <= self.config.max_attempts {
            return Ok(RateLimitDecision::Allowed {
                remaining: self.config.max_attempts - entry.attempts,
            });
        }

        let retry_after_secs = u64::try_from((entry.expires_at - now).num_seconds())
            .unwrap_or(0)
            .max(1);
        let minutes = retry_after_secs.div_ceil(60);

        info!(
            key = %key,
            attempts = entry.attempts,
            retry_after_secs,
            "Subscription attempt rate limited"
        );

        Ok(RateLimitDecision::Limited {
            retry_after_secs,
            message: format!(
                "Too many subscription attempts. Please try again in {minutes} minute{}.",
                if minutes == 1 { "" } else { "s" }
            ),
        })
    }
}
