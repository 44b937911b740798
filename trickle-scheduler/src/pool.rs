//! Process-wide cache of the eligible content ids.
//!
//! Listing eligible content is the one query every subscriber in a batch
//! shares, so it is fetched once and kept for a TTL. The cached list is kept
//! in ascending order; callers shuffle their own candidate set.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use trickle_common::ContentId;
use trickle_store::ContentSource;

#[derive(Debug)]
struct Cached {
    fetched_at: DateTime<Utc>,
    ids: Arc<[ContentId]>,
}

#[derive(Debug)]
pub struct EligiblePool {
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
}

impl Default for EligiblePool {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl EligiblePool {
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// The eligible ids, refreshed from `source` once the cached copy is older
    /// than the TTL.
    pub async fn get(
        &self,
        source: &dyn ContentSource,
        now: DateTime<Utc>,
    ) -> trickle_store::Result<Arc<[ContentId]>> {
        let fresh = self
            .cached
            .read()
            .as_ref()
            .filter(|cached| cached.fetched_at <= now && now < cached.fetched_at + self.ttl)
            .map(|cached| Arc::clone(&cached.ids));
        if let Some(ids) = fresh {
            return Ok(ids);
        }

        let mut ids = source.eligible_content_ids().await?;
        ids.sort_unstable();
        ids.dedup();
        let ids: Arc<[ContentId]> = ids.into();

        tracing::debug!(count = ids.len(), "Refreshed eligible content pool");
        *self.cached.write() = Some(Cached {
            fetched_at: now,
            ids: Arc::clone(&ids),
        });

        Ok(ids)
    }

    /// Drop the cached list so the next [`get`](Self::get) refetches.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}
