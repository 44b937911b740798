//! Delivery side of the drip pipeline
//!
//! This crate provides functionality to:
//! - Claim due jobs from the queue and send them through a mail transport
//! - Retry temporary failures with backoff and dead-letter the rest
//! - Requeue dead letters on operator request
//! - Record analytics events exactly once
//! - Rate limit inbound subscription attempts

pub mod analytics;
pub mod dead_letter;
mod error;
pub mod policy;
mod processor;
pub mod rate_limiter;
pub mod transport;

pub use analytics::{AnalyticsRecorder, NewEvent, Recorded};
pub use dead_letter::DeadLetterService;
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use policy::{BackoffStrategy, RetryPolicy};
pub use processor::{MaintenanceReport, ProcessReport, QueueProcessor};
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, SubscriptionRateLimiter};
pub use transport::{
    LogTransport, MailTransport, OutboundMessage, SmtpConfig, SmtpTransport, TransportConfig,
};
