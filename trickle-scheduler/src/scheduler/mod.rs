//! Drip scheduler orchestration

pub mod reconcile;
pub mod tick;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use trickle_common::{JobId, SendingConfig, Signal, SubscriberRecord, internal, template::Vars};
use trickle_store::{
    BackingStore, ContentSource, MirrorStore, NewJob, QueueStore, SubscriberMirror,
    SubscriberSource,
};

pub use self::{reconcile::Reconciliation, tick::TickReport};
use crate::{
    error::SchedulerError,
    pool::EligiblePool,
    templates::{DripTemplates, Notice},
};

const fn default_schedule_interval() -> u64 {
    3600 // 1 hour
}

const fn default_pool_ttl() -> u64 {
    900 // 15 minutes
}

/// Picks the next letter for every due subscriber and puts it on the queue.
///
/// # Example
///
/// ```ron
/// scheduler: (
///     schedule_interval_secs: 3600,
///     pool_ttl_secs: 900,
///     templates: (
///         unsubscribe_url_base: "https://example.com/unsubscribe",
///     ),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct DripScheduler {
    /// How often to run a scheduling pass (in seconds)
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_secs: u64,

    /// How long the eligible content list is cached (in seconds)
    #[serde(default = "default_pool_ttl")]
    pub pool_ttl_secs: u64,

    #[serde(default)]
    pub templates: DripTemplates,

    #[serde(skip)]
    pub(crate) store: Option<Arc<dyn BackingStore>>,

    #[serde(skip)]
    pub(crate) subscribers: Option<Arc<dyn SubscriberSource>>,

    #[serde(skip)]
    pub(crate) content: Option<Arc<dyn ContentSource>>,

    #[serde(skip)]
    pub(crate) pool: EligiblePool,
}

impl Default for DripScheduler {
    fn default() -> Self {
        Self {
            schedule_interval_secs: default_schedule_interval(),
            pool_ttl_secs: default_pool_ttl(),
            templates: DripTemplates::default(),
            store: None,
            subscribers: None,
            content: None,
            pool: EligiblePool::default(),
        }
    }
}

/// The initialised dependencies, borrowed for one operation
pub(crate) struct Parts<'a> {
    pub store: &'a Arc<dyn BackingStore>,
    pub subscribers: &'a Arc<dyn SubscriberSource>,
    pub content: &'a Arc<dyn ContentSource>,
}

impl DripScheduler {
    /// Initialize the drip scheduler
    pub fn init(
        &mut self,
        store: Arc<dyn BackingStore>,
        subscribers: Arc<dyn SubscriberSource>,
        content: Arc<dyn ContentSource>,
    ) {
        internal!(
            "Initialising Drip Scheduler, interval={}s, pool_ttl={}s",
            self.schedule_interval_secs,
            self.pool_ttl_secs
        );

        let ttl = i64::try_from(self.pool_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        self.pool = EligiblePool::new(ttl);
        self.store = Some(store);
        self.subscribers = Some(subscribers);
        self.content = Some(content);
    }

    pub(crate) fn parts(&self) -> Result<Parts<'_>, SchedulerError> {
        match (&self.store, &self.subscribers, &self.content) {
            (Some(store), Some(subscribers), Some(content)) => Ok(Parts {
                store,
                subscribers,
                content,
            }),
            _ => Err(SchedulerError::NotInitialized(
                "Drip scheduler not initialized. Call init() first.".to_string(),
            )),
        }
    }

    /// Copy an authoritative record into the mirror.
    ///
    /// Counters are kept. A subscriber becoming live without a next send time
    /// is due immediately; one leaving the live state loses it.
    ///
    /// Returns `false` if the mirror already holds a newer copy.
    pub async fn sync_subscriber(
        &self,
        record: &SubscriberRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let store = self.parts()?.store;
        let existing = store.get_mirror(record.id).await?;
        let written = store
            .upsert_mirror(mirror_from(record, existing.as_ref(), now))
            .await?;

        if !written {
            tracing::debug!(subscriber_id = %record.id, "Ignored stale subscriber record");
        }
        Ok(written)
    }

    /// Queue a transactional notice for `record` outside the drip rotation.
    pub async fn enqueue_notice(
        &self,
        notice: Notice,
        record: &SubscriberRecord,
        now: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        let store = self.parts()?.store;
        let unsubscribe_url = self.templates.unsubscribe_url(record.id);
        let vars = Vars {
            subscriber_email: &record.email,
            unsubscribe_url: &unsubscribe_url,
            ..Vars::default()
        };
        let (subject, body) = self.templates.notice(notice).render(&vars);

        let job = NewJob::new(
            record.id,
            record.email.clone(),
            notice.template_name(),
            subject,
            body,
        )
        .with_priority(notice.priority());

        let id = store.enqueue(job, now).await?;
        tracing::info!(subscriber_id = %record.id, job_id = %id, template = notice.template_name(), "Queued notice");
        Ok(id)
    }

    /// Run the drip scheduler
    ///
    /// Runs a scheduling pass every `schedule_interval_secs` until a shutdown
    /// signal arrives. Pausing sending does not stop the scheduler; jobs keep
    /// accumulating for the processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler was never initialised
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        config: watch::Receiver<SendingConfig>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SchedulerError> {
        internal!("Drip scheduler starting");
        self.parts()?;

        let mut schedule_timer =
            tokio::time::interval(Duration::from_secs(self.schedule_interval_secs.max(1)));
        schedule_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = schedule_timer.tick() => {
                    let snapshot = config.borrow().clone();

                    match self.tick(&snapshot, Utc::now()).await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(?report, "Scheduled due subscribers");
                        }
                        Ok(_) => {
                            tracing::debug!("Scheduling pass found no due subscribers");
                        }
                        Err(e) => {
                            tracing::error!("Error running scheduling pass: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!("Drip scheduler received shutdown signal");
                            break;
                        }
                        Ok(Signal::Reload) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(e) => {
                            tracing::error!("Drip scheduler shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        internal!("Drip scheduler shutdown complete");
        Ok(())
    }
}

/// Mirror row for `record`, carrying over counters and schedule from `existing`.
pub(crate) fn mirror_from(
    record: &SubscriberRecord,
    existing: Option<&SubscriberMirror>,
    now: DateTime<Utc>,
) -> SubscriberMirror {
    let next_send_at = if record.is_live() {
        existing.and_then(|row| row.next_send_at).or(Some(now))
    } else {
        None
    };

    SubscriberMirror {
        id: record.id,
        email: record.email.clone(),
        status: record.status,
        frequency: record.frequency,
        preferences: record.preferences,
        next_send_at,
        emails_sent: existing.map_or(0, |row| row.emails_sent),
        last_sent_at: existing.and_then(|row| row.last_sent_at),
        source_updated_at: record.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use trickle_common::{Frequency, Preferences, SubscriberId, SubscriberStatus};

    use super::*;

    fn record(status: SubscriberStatus, verified: bool) -> SubscriberRecord {
        SubscriberRecord {
            id: SubscriberId(1),
            email: "reader@example.com".to_string(),
            status,
            verified,
            frequency: Frequency::Daily,
            preferences: Preferences::all(),
            consent_confirmed: true,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_mirror_from_new_live_record_is_due() {
        let now = Utc::now();
        let row = mirror_from(&record(SubscriberStatus::Active, true), None, now);
        assert_eq!(row.next_send_at, Some(now));
        assert_eq!(row.emails_sent, 0);
    }

    #[test]
    fn test_mirror_from_keeps_schedule_and_counters() {
        let now = Utc::now();
        let mut existing = mirror_from(&record(SubscriberStatus::Active, true), None, now);
        existing.next_send_at = Some(now + chrono::Duration::days(3));
        existing.emails_sent = 4;

        let row = mirror_from(&record(SubscriberStatus::Active, true), Some(&existing), now);
        assert_eq!(row.next_send_at, existing.next_send_at);
        assert_eq!(row.emails_sent, 4);

        let row = mirror_from(&record(SubscriberStatus::Paused, true), Some(&existing), now);
        assert_eq!(row.next_send_at, None);
        assert_eq!(row.emails_sent, 4);

        let row = mirror_from(&record(SubscriberStatus::Active, false), Some(&existing), now);
        assert_eq!(row.next_send_at, None);
    }

    #[test]
    fn test_parse_scheduler_config() {
        let scheduler: DripScheduler =
            ron::from_str("(schedule_interval_secs: 60)").expect("Failed to parse scheduler");
        assert_eq!(scheduler.schedule_interval_secs, 60);
        assert_eq!(scheduler.pool_ttl_secs, 900);
        assert!(scheduler.parts().is_err());
    }
}
