//! The trickle daemon: configuration, wiring and the long running loops.

pub mod config;
pub mod controller;

pub use controller::{SHUTDOWN_BROADCAST, Trickle};
