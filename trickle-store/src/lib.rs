//! Durable state for the drip pipeline.
//!
//! The queue, dead-letter, email-log, analytics, rate-limit and subscriber
//! mirror tables live behind the traits in [`r#trait`]. Two backends
//! implement all of them:
//!
//! - [`MemoryBackingStore`]: a single mutex around plain collections, used by
//!   tests and throwaway runs
//! - [`SqliteBackingStore`]: `sqlx` on SQLite for production
//!
//! Every job status change is a conditional transition on the current status,
//! so two processors sharing one database can never both act on a job.

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryBackingStore, SqliteBackingStore};
pub use config::{MemoryConfig, OpenStore, SqliteConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use r#trait::{
    BackingStore, ContentSource, DeadLetterStore, EmailLogStore, EventStore, MirrorStore,
    QueueStore, RateLimitStore, SubscriberSource,
};
pub use types::{
    AnalyticsEvent, Claim, ContentItem, DeadLetter, EmailLog, NewEmailLog, NewJob, QueueJob, QueueStats,
    RateLimitEntry, SubscriberMirror,
};
