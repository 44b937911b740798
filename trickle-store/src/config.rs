use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::{
    StoreError,
    backends::{MemoryBackingStore, SqliteBackingStore},
    r#trait::{BackingStore, ContentSource, SubscriberSource},
};

/// An opened store: the pipeline tables plus the two read-only sources the
/// same backend serves.
#[derive(Debug, Clone)]
pub struct OpenStore {
    pub store: Arc<dyn BackingStore>,
    pub subscribers: Arc<dyn SubscriberSource>,
    pub content: Arc<dyn ContentSource>,
}

impl<T> From<Arc<T>> for OpenStore
where
    T: BackingStore + SubscriberSource + ContentSource + 'static,
{
    fn from(backend: Arc<T>) -> Self {
        Self {
            store: backend.clone(),
            subscribers: backend.clone(),
            content: backend,
        }
    }
}

/// Configuration for the backing store
///
/// Written with the `unwrap_variant_newtypes` and `implicit_some` RON
/// extensions enabled.
///
/// # Examples
///
/// SQLite store in RON config:
/// ```ron
/// Trickle (
///     store: Sqlite(
///         path: "/var/lib/trickle/trickle.db",
///     ),
/// )
/// ```
///
/// Memory store with a job limit:
/// ```ron
/// Trickle (
///     store: Memory(
///         capacity: 1000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// Memory-based store (testing/development)
    Memory(MemoryConfig),
    /// SQLite database (production)
    Sqlite(SqliteConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteConfig::default())
    }
}

impl StoreConfig {
    /// Database file for SQLite stores, `None` for memory stores
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Sqlite(config) => Some(&config.path),
            Self::Memory(_) => None,
        }
    }

    /// Open the configured store.
    ///
    /// # Errors
    /// If the SQLite database cannot be opened or migrated.
    pub async fn open(self) -> crate::Result<OpenStore> {
        Ok(match self {
            Self::Memory(MemoryConfig { capacity: None }) => Arc::new(MemoryBackingStore::new()).into(),
            Self::Memory(MemoryConfig {
                capacity: Some(capacity),
            }) => Arc::new(MemoryBackingStore::with_capacity(capacity)).into(),
            Self::Sqlite(config) => Arc::new(SqliteBackingStore::open(&config).await?).into(),
        })
    }
}

/// Configuration for the memory store
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of jobs to hold (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn path() -> PathBuf {
        PathBuf::from("/var/lib/trickle/trickle.db")
    }

    pub const fn max_connections() -> u32 {
        5
    }

    pub const fn busy_timeout_secs() -> u64 {
        5
    }
}

/// Configuration for the SQLite store
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "defaults::path")]
    pub path: PathBuf,

    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,

    /// Seconds a connection waits on a locked database before failing
    #[serde(default = "defaults::busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: defaults::path(),
            max_connections: defaults::max_connections(),
            busy_timeout_secs: defaults::busy_timeout_secs(),
        }
    }
}

impl SqliteConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Reject database paths that are relative, escape upwards, or point into
    /// system directories.
    ///
    /// # Errors
    /// [`StoreError::Validation`] describing the problem.
    pub fn validate(&self) -> crate::Result<()> {
        let path = &self.path;

        if path.components().any(|component| component == Component::ParentDir) {
            return Err(StoreError::Validation(format!(
                "Database path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(StoreError::Validation(format!(
                "Database path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in &sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(StoreError::Validation(format!(
                    "Database path cannot be in system directory {prefix}: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ron::extensions::Extensions;

    use super::*;
    use crate::r#trait::QueueStore;

    fn parse(input: &str) -> StoreConfig {
        ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES)
            .from_str(input)
            .expect("Failed to parse store config")
    }

    #[test]
    fn test_parse_store_config() {
        let config = parse(r#"Sqlite(path: "/srv/trickle/db.sqlite")"#);
        assert_eq!(config.path(), Some(Path::new("/srv/trickle/db.sqlite")));

        let StoreConfig::Sqlite(sqlite) = config else {
            panic!("Expected sqlite config");
        };
        assert_eq!(sqlite.max_connections, 5);
        assert_eq!(sqlite.busy_timeout_secs, 5);

        let config = parse("Memory(capacity: 10)");
        assert!(matches!(
            config,
            StoreConfig::Memory(MemoryConfig { capacity: Some(10) })
        ));
        assert_eq!(config.path(), None);
    }

    #[test]
    fn test_default_is_sqlite() {
        let config = StoreConfig::default();
        assert_eq!(config.path(), Some(Path::new("/var/lib/trickle/trickle.db")));
    }

    #[test]
    fn test_path_validation() {
        assert!(SqliteConfig::at("/var/lib/trickle/trickle.db").validate().is_ok());
        assert!(SqliteConfig::at("relative/trickle.db").validate().is_err());
        assert!(SqliteConfig::at("/var/lib/../trickle.db").validate().is_err());
        assert!(SqliteConfig::at("/etc/trickle.db").validate().is_err());
        assert!(SqliteConfig::at("/proc/self/db").validate().is_err());
    }

    #[tokio::test]
    async fn test_memory_config_builds_store() {
        let opened = StoreConfig::Memory(MemoryConfig::default())
            .open()
            .await
            .expect("Failed to build store");
        assert_eq!(opened.store.stats().await.expect("stats").pending, 0);
        assert!(
            opened
                .content
                .eligible_content_ids()
                .await
                .expect("content")
                .is_empty()
        );
    }
}
