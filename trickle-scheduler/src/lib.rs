//! Drip scheduling for the trickle pipeline
//!
//! This crate provides functionality to:
//! - Find subscribers whose next letter is due
//! - Reconcile the subscriber mirror against the owning records
//! - Pick one unseen piece of content per subscriber and queue it
//! - Queue transactional notices outside the rotation

pub mod error;
pub mod pool;
mod scheduler;
pub mod templates;

pub use error::SchedulerError;
pub use pool::EligiblePool;
pub use scheduler::{DripScheduler, Reconciliation, TickReport, tick::content_marker};
pub use templates::{DripTemplates, Notice};
