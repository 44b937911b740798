//! Backing store implementations
//!
//! - `memory`: everything behind one mutex, for tests and throwaway runs
//! - `sqlite`: `sqlx` on a SQLite file for production use

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackingStore;
pub use sqlite::SqliteBackingStore;
