//! Error types for the trickle-scheduler crate.

use thiserror::Error;
use trickle_common::{ContentId, SubscriberId};
use trickle_store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backing store or one of the sources failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler used before `init()`.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Every candidate for a subscriber vanished between listing and loading.
    #[error("No loadable content for subscriber {subscriber} (tried {tried:?})")]
    ContentUnavailable {
        subscriber: SubscriberId,
        tried: Vec<ContentId>,
    },
}
