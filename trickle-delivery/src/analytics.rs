//! Idempotent analytics ingestion.
//!
//! Every event is keyed by a deterministic hash of who saw what, so a
//! tracking pixel fetched twice or a webhook delivered twice is counted once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use trickle_common::{ContentId, EventType, JobId, SubscriberId, SubscriberStatus};
use trickle_store::{AnalyticsEvent, BackingStore, EventStore, MirrorStore, StoreError};

use crate::error::DeliveryError;

/// An observation to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub newsletter_id: ContentId,
    pub queue_id: Option<JobId>,
    pub subscriber_id: SubscriberId,
    /// Clicked URL, if any
    pub target: Option<String>,
}

impl NewEvent {
    #[must_use]
    pub const fn new(
        event_type: EventType,
        newsletter_id: ContentId,
        subscriber_id: SubscriberId,
    ) -> Self {
        Self {
            event_type,
            newsletter_id,
            queue_id: None,
            subscriber_id,
            target: None,
        }
    }

    #[must_use]
    pub const fn for_job(mut self, queue_id: JobId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// SHA-256 hex of `source|subscriber|type|target`.
    ///
    /// The source is `q:<queue id>`, or `n:<newsletter id>` when there is no
    /// queue id, so the two id spaces never collide. A missing target is the
    /// empty string.
    #[must_use]
    pub fn hash(&self) -> String {
        let source = self.queue_id.map_or_else(
            || format!("n:{}", self.newsletter_id),
            |job| format!("q:{job}"),
        );
        let input = format!(
            "{source}|{}|{}|{}",
            self.subscriber_id,
            self.event_type,
            self.target.as_deref().unwrap_or_default()
        );
        hex::encode(Sha256::digest(input.as_bytes()))
    }

    fn into_event(self, occurred_at: DateTime<Utc>) -> AnalyticsEvent {
        let event_hash = self.hash();
        AnalyticsEvent {
            newsletter_id: self.newsletter_id,
            queue_id: self.queue_id,
            subscriber_id: self.subscriber_id,
            event_type: self.event_type,
            target: self.target,
            event_hash,
            occurred_at,
        }
    }
}

/// Outcome of [`AnalyticsRecorder::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    /// An identical event was already stored; nothing changed
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct AnalyticsRecorder {
    store: Arc<dyn BackingStore>,
}

impl AnalyticsRecorder {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Store `event` once.
    ///
    /// Unsubscribe and bounce events also take the subscriber out of the
    /// scheduler's rotation. That happens on duplicates too, so a retried
    /// webhook still converges.
    pub async fn record(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<Recorded, DeliveryError> {
        let event_type = event.event_type;
        let subscriber = event.subscriber_id;

        let event = event.into_event(now);
        let hash = event.event_hash.clone();
        let recorded = if self.store.insert_event(event).await? {
            Recorded::Inserted
        } else {
            debug!(event_hash = %hash, "Duplicate analytics event dropped");
            Recorded::Duplicate
        };

        let status = match event_type {
            EventType::Unsubscribed => Some(SubscriberStatus::Unsubscribed),
            EventType::Bounced => Some(SubscriberStatus::Bounced),
            _ => None,
        };

        if let Some(status) = status {
            match self.store.set_mirror_status(subscriber, status).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(subscriber_id = %subscriber, error = %e, "Failed to update subscriber status");
                    return Err(e.into());
                }
            }
        }

        Ok(recorded)
    }

    pub async fn count(
        &self,
        newsletter: ContentId,
        event_type: EventType,
    ) -> Result<u64, DeliveryError> {
        Ok(self.store.count_events(newsletter, event_type).await?)
    }
}
