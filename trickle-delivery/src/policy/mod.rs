//! Policy abstractions for delivery operations.
//!
//! - [`RetryPolicy`]: whether a failed job gets another attempt and when
//! - [`BackoffStrategy`]: the spacing between attempts

pub mod retry;

pub use retry::{BackoffStrategy, RetryPolicy};
