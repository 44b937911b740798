//! Mirror reconciliation
//!
//! The mirror is a scheduling copy of subscriber records owned elsewhere. Every
//! due row is checked against its owner before anything is queued for it.

use chrono::{DateTime, Utc};
use trickle_common::{SubscriberRecord, SubscriberStatus};
use trickle_store::{BackingStore, MirrorStore, SubscriberMirror, SubscriberSource};

use super::{DripScheduler, mirror_from};
use crate::error::SchedulerError;

/// Result of checking one mirror row against the owning record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Still active and verified
    ///
    /// A `corrected` row sits out the pass it was rewritten in.
    Live {
        row: SubscriberMirror,
        record: SubscriberRecord,
        /// The mirror disagreed with the owner and was rewritten
        corrected: bool,
    },
    /// No longer eligible; the mirror now says so and has no next send time
    Dropped { status: SubscriberStatus },
}

impl Reconciliation {
    #[must_use]
    pub const fn is_corrected(&self) -> bool {
        matches!(
            self,
            Self::Live {
                corrected: true,
                ..
            } | Self::Dropped { .. }
        )
    }
}

impl DripScheduler {
    /// Compare `row` with the authoritative record and repair the mirror.
    pub async fn reconcile(
        &self,
        row: &SubscriberMirror,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, SchedulerError> {
        let parts = self.parts()?;

        let Some(record) = parts.subscribers.subscriber(row.id).await? else {
            tracing::warn!(subscriber_id = %row.id, "Subscriber has no owning record, dropping from schedule");
            return drop_row(parts.store.as_ref(), row, SubscriberStatus::Inactive).await;
        };

        if !record.is_live() {
            tracing::info!(
                subscriber_id = %row.id,
                status = %record.status,
                verified = record.verified,
                "Subscriber is no longer live, dropping from schedule"
            );
            return drop_row(parts.store.as_ref(), row, record.status).await;
        }

        if !row.diverges_from(&record) {
            return Ok(Reconciliation::Live {
                row: row.clone(),
                record,
                corrected: false,
            });
        }

        let corrected = mirror_from(&record, Some(row), now);
        let written = parts.store.upsert_mirror(corrected.clone()).await?;
        tracing::info!(subscriber_id = %row.id, written, "Corrected stale subscriber mirror");

        Ok(Reconciliation::Live {
            row: corrected,
            record,
            corrected: true,
        })
    }
}

async fn drop_row(
    store: &dyn BackingStore,
    row: &SubscriberMirror,
    status: SubscriberStatus,
) -> Result<Reconciliation, SchedulerError> {
    store.set_mirror_status(row.id, status).await?;
    store.set_next_send(row.id, None).await?;
    Ok(Reconciliation::Dropped { status })
}
