use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use trickle_common::{
    ContentId, DeadLetterId, EventType, JobId, JobStatus, LogStatus, SubscriberId,
    SubscriberRecord, SubscriberStatus,
};

use crate::{
    StoreError,
    r#trait::{
        ContentSource, DeadLetterStore, EmailLogStore, EventStore, MirrorStore, QueueStore,
        RateLimitStore, SubscriberSource,
    },
    types::{
        AnalyticsEvent, CLAIM_EXPIRED, Claim, ContentItem, DeadLetter, EmailLog, NewEmailLog,
        NewJob, QueueJob, QueueStats, RateLimitEntry, SubscriberMirror, error_log_line,
    },
};

#[derive(Debug, Default)]
struct Tables {
    next_job: i64,
    jobs: BTreeMap<JobId, QueueJob>,
    next_dead_letter: i64,
    dead_letters: BTreeMap<DeadLetterId, DeadLetter>,
    logs: Vec<EmailLog>,
    events: HashMap<String, AnalyticsEvent>,
    rate_limits: HashMap<String, RateLimitEntry>,
    mirror: BTreeMap<SubscriberId, SubscriberMirror>,
    subscribers: HashMap<SubscriberId, SubscriberRecord>,
    content: BTreeMap<ContentId, (ContentItem, bool)>,
}

impl Tables {
    fn job_mut(&mut self, id: JobId) -> crate::Result<&mut QueueJob> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::job_not_found(id))
    }

    /// The job behind `claim`, provided the claim is still the current one.
    fn claimed_mut(&mut self, claim: Claim) -> crate::Result<&mut QueueJob> {
        let job = self.job_mut(claim.job)?;
        expect_status(job, JobStatus::Processing)?;
        if job.claims != claim.generation {
            return Err(StoreError::ClaimLost {
                job: claim.job,
                generation: claim.generation,
            });
        }
        Ok(job)
    }

    fn insert_job(&mut self, job: NewJob, now: DateTime<Utc>) -> JobId {
        self.next_job += 1;
        let id = JobId(self.next_job);
        self.jobs.insert(id, job.into_job(id, now));
        id
    }
}

fn expect_status(job: &QueueJob, expected: JobStatus) -> crate::Result<()> {
    if job.status == expected {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            job: job.id,
            expected: expected.as_str(),
            found: job.status,
        })
    }
}

/// In-memory backing store
///
/// Every table lives behind one mutex, so each trait method is atomic with
/// respect to every other. The store also stands in for the authoritative
/// subscriber and content sources; seed them with
/// [`MemoryBackingStore::insert_subscriber`] and
/// [`MemoryBackingStore::insert_content`].
///
/// # Capacity Management
/// With a capacity set, [`QueueStore::enqueue`] fails once that many jobs are
/// held, whatever their status.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    tables: Arc<Mutex<Tables>>,
    /// Maximum number of jobs to hold (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Arc::default(),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of jobs held, in any status
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace an authoritative subscriber record.
    pub fn insert_subscriber(&self, record: SubscriberRecord) {
        self.tables.lock().subscribers.insert(record.id, record);
    }

    pub fn remove_subscriber(&self, id: SubscriberId) {
        self.tables.lock().subscribers.remove(&id);
    }

    /// Add or replace a content item. Only `eligible` items are offered to the scheduler.
    pub fn insert_content(&self, item: ContentItem, eligible: bool) {
        self.tables.lock().content.insert(item.id, (item, eligible));
    }

    pub fn set_content_eligible(&self, id: ContentId, eligible: bool) {
        if let Some(entry) = self.tables.lock().content.get_mut(&id) {
            entry.1 = eligible;
        }
    }

    /// Every analytics event recorded so far, in no particular order.
    #[must_use]
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.tables.lock().events.values().cloned().collect()
    }
}

#[async_trait]
impl QueueStore for MemoryBackingStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> crate::Result<JobId> {
        job.validate()?;

        let mut tables = self.tables.lock();
        if let Some(capacity) = self.capacity
            && tables.jobs.len() >= capacity
        {
            return Err(StoreError::CapacityExceeded {
                used: tables.jobs.len(),
                capacity,
            });
        }

        Ok(tables.insert_job(job, now))
    }

    async fn get_job(&self, id: JobId) -> crate::Result<QueueJob> {
        self.tables
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::job_not_found(id))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> crate::Result<Vec<QueueJob>> {
        let mut tables = self.tables.lock();

        let mut due: Vec<_> = tables
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .map(|job| (job.priority, job.scheduled_at, job.id))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            let job = tables.job_mut(id)?;
            job.status = JobStatus::Processing;
            job.claims += 1;
            job.claimed_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }

        Ok(claimed)
    }

    async fn mark_sent(&self, claim: Claim, now: DateTime<Utc>) -> crate::Result<()> {
        let mut tables = self.tables.lock();
        let job = tables.claimed_mut(claim)?;

        job.status = JobStatus::Sent;
        job.sent_at = Some(now);
        job.claimed_at = None;
        job.error = None;
        job.updated_at = now;
        Ok(())
    }

    async fn reschedule(
        &self,
        claim: Claim,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<QueueJob> {
        let mut tables = self.tables.lock();
        let job = tables.claimed_mut(claim)?;

        job.status = JobStatus::Pending;
        job.attempts += 1;
        job.scheduled_at = next_attempt_at;
        job.claimed_at = None;
        job.error = Some(error.to_string());
        job.error_log.push(error_log_line(now, error));
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn cancel(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> crate::Result<()> {
        let mut tables = self.tables.lock();
        let job = tables.job_mut(id)?;
        expect_status(job, JobStatus::Pending)?;

        job.status = JobStatus::Cancelled;
        job.error = Some(reason.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn cancel_claimed(
        &self,
        claim: Claim,
        reason: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let mut tables = self.tables.lock();
        let job = tables.claimed_mut(claim)?;

        job.status = JobStatus::Cancelled;
        job.claimed_at = None;
        job.error = Some(reason.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<u64> {
        let mut tables = self.tables.lock();
        let mut released = 0;
        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.claimed_at.is_some_and(|at| at < claimed_before)
            {
                job.status = JobStatus::Pending;
                job.attempts += 1;
                job.claimed_at = None;
                job.error = Some(CLAIM_EXPIRED.to_string());
                job.error_log.push(error_log_line(now, CLAIM_EXPIRED));
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn purge_jobs(&self, before: DateTime<Utc>) -> crate::Result<u64> {
        let mut tables = self.tables.lock();
        let held = tables.jobs.len();
        tables.jobs.retain(|_, job| {
            !(matches!(job.status, JobStatus::Sent | JobStatus::Cancelled)
                && job.updated_at < before)
        });
        Ok((held - tables.jobs.len()) as u64)
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> crate::Result<Vec<QueueJob>> {
        Ok(self
            .tables
            .lock()
            .jobs
            .values()
            .rev()
            .filter(|job| status.is_none_or(|status| job.status == status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> crate::Result<QueueStats> {
        let tables = self.tables.lock();
        let mut stats = QueueStats {
            dead_letters: tables.dead_letters.len() as u64,
            ..QueueStats::default()
        };
        for job in tables.jobs.values() {
            stats.bump(job.status);
        }
        Ok(stats)
    }

    async fn queued_content_ids(&self, subscriber: SubscriberId) -> crate::Result<Vec<ContentId>> {
        let mut ids: Vec<_> = self
            .tables
            .lock()
            .jobs
            .values()
            .filter(|job| {
                job.subscriber_id == subscriber
                    && matches!(job.status, JobStatus::Pending | JobStatus::Processing)
            })
            .filter_map(|job| job.content_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryBackingStore {
    async fn dead_letter(
        &self,
        claim: Claim,
        error: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<DeadLetter> {
        let mut tables = self.tables.lock();
        let job = tables.claimed_mut(claim)?;

        job.status = JobStatus::Failed;
        job.attempts += 1;
        job.claimed_at = None;
        job.error = Some(error.to_string());
        job.error_log.push(error_log_line(now, error));
        job.updated_at = now;
        let job = job.clone();

        tables.next_dead_letter += 1;
        let letter = DeadLetter::from_job(DeadLetterId(tables.next_dead_letter), &job, now);
        tables.dead_letters.insert(letter.id, letter.clone());
        Ok(letter)
    }

    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> crate::Result<JobId> {
        let mut tables = self.tables.lock();
        let letter = tables
            .dead_letters
            .get(&id)
            .ok_or_else(|| StoreError::dead_letter_not_found(id))?;
        if letter.requeued_at.is_some() {
            return Err(StoreError::AlreadyRequeued(id));
        }

        let job = letter.to_new_job();
        let job_id = tables.insert_job(job, now);
        if let Some(letter) = tables.dead_letters.get_mut(&id) {
            letter.requeued_at = Some(now);
            letter.requeued_job_id = Some(job_id);
        }
        Ok(job_id)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> crate::Result<DeadLetter> {
        self.tables
            .lock()
            .dead_letters
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::dead_letter_not_found(id))
    }

    async fn list_dead_letters(&self, limit: usize) -> crate::Result<Vec<DeadLetter>> {
        Ok(self
            .tables
            .lock()
            .dead_letters
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EmailLogStore for MemoryBackingStore {
    async fn append_log(&self, entry: NewEmailLog) -> crate::Result<i64> {
        let mut tables = self.tables.lock();
        let id = i64::try_from(tables.logs.len()).unwrap_or(i64::MAX - 1) + 1;
        tables.logs.push(EmailLog {
            id,
            job_id: entry.job_id,
            subscriber_id: entry.subscriber_id,
            template: entry.template,
            content_id: entry.content_id,
            status: entry.status,
            detail: entry.detail,
            logged_at: entry.logged_at,
        });
        Ok(id)
    }

    async fn already_sent_content_ids(
        &self,
        subscriber: SubscriberId,
    ) -> crate::Result<Vec<ContentId>> {
        let mut ids: Vec<_> = self
            .tables
            .lock()
            .logs
            .iter()
            .filter(|log| log.subscriber_id == subscriber && log.status == LogStatus::Sent)
            .filter_map(|log| log.content_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn logs_for(&self, subscriber: SubscriberId) -> crate::Result<Vec<EmailLog>> {
        Ok(self
            .tables
            .lock()
            .logs
            .iter()
            .filter(|log| log.subscriber_id == subscriber)
            .cloned()
            .collect())
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> crate::Result<u64> {
        let mut tables = self.tables.lock();
        let held = tables.logs.len();
        tables
            .logs
            .retain(|log| log.logged_at >= before || log.records_delivered_content());
        Ok((held - tables.logs.len()) as u64)
    }
}

#[async_trait]
impl EventStore for MemoryBackingStore {
    async fn insert_event(&self, event: AnalyticsEvent) -> crate::Result<bool> {
        let mut tables = self.tables.lock();
        if tables.events.contains_key(&event.event_hash) {
            return Ok(false);
        }
        tables.events.insert(event.event_hash.clone(), event);
        Ok(true)
    }

    async fn count_events(
        &self,
        newsletter: ContentId,
        event_type: EventType,
    ) -> crate::Result<u64> {
        Ok(self
            .tables
            .lock()
            .events
            .values()
            .filter(|event| event.newsletter_id == newsletter && event.event_type == event_type)
            .count() as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryBackingStore {
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> crate::Result<RateLimitEntry> {
        let mut tables = self.tables.lock();
        let entry = tables
            .rate_limits
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    entry.attempts = 1;
                    entry.expires_at = now + window;
                } else {
                    entry.attempts = entry.attempts.saturating_add(1);
                }
            })
            .or_insert_with(|| RateLimitEntry {
                key: key.to_string(),
                attempts: 1,
                expires_at: now + window,
            });
        Ok(entry.clone())
    }

    async fn purge_rate_limits(&self, now: DateTime<Utc>) -> crate::Result<u64> {
        let mut tables = self.tables.lock();
        let held = tables.rate_limits.len();
        tables.rate_limits.retain(|_, entry| !entry.is_expired(now));
        Ok((held - tables.rate_limits.len()) as u64)
    }
}

#[async_trait]
impl MirrorStore for MemoryBackingStore {
    async fn get_mirror(&self, id: SubscriberId) -> crate::Result<Option<SubscriberMirror>> {
        Ok(self.tables.lock().mirror.get(&id).cloned())
    }

    async fn upsert_mirror(&self, row: SubscriberMirror) -> crate::Result<bool> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.mirror.get(&row.id)
            && existing.source_updated_at > row.source_updated_at
        {
            return Ok(false);
        }
        tables.mirror.insert(row.id, row);
        Ok(true)
    }

    async fn due_subscribers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> crate::Result<Vec<SubscriberMirror>> {
        let tables = self.tables.lock();
        let mut due: Vec<_> = tables
            .mirror
            .values()
            .filter(|row| row.status.is_active() && row.next_send_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|row| (row.next_send_at, row.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn set_next_send(
        &self,
        id: SubscriberId,
        next: Option<DateTime<Utc>>,
    ) -> crate::Result<()> {
        let mut tables = self.tables.lock();
        let row = tables.mirror.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "Subscriber",
            id: id.get(),
        })?;
        row.next_send_at = next;
        Ok(())
    }

    async fn set_mirror_status(
        &self,
        id: SubscriberId,
        status: SubscriberStatus,
    ) -> crate::Result<()> {
        let mut tables = self.tables.lock();
        let row = tables.mirror.get_mut(&id).ok_or(StoreError::NotFound {
            kind: "Subscriber",
            id: id.get(),
        })?;
        row.status = status;
        if !status.is_active() {
            row.next_send_at = None;
        }
        Ok(())
    }

    async fn record_delivery(&self, id: SubscriberId, at: DateTime<Utc>) -> crate::Result<()> {
        if let Some(row) = self.tables.lock().mirror.get_mut(&id) {
            row.emails_sent += 1;
            row.last_sent_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberSource for MemoryBackingStore {
    async fn subscriber(&self, id: SubscriberId) -> crate::Result<Option<SubscriberRecord>> {
        Ok(self.tables.lock().subscribers.get(&id).cloned())
    }
}

#[async_trait]
impl ContentSource for MemoryBackingStore {
    async fn eligible_content_ids(&self) -> crate::Result<Vec<ContentId>> {
        Ok(self
            .tables
            .lock()
            .content
            .iter()
            .filter(|(_, (_, eligible))| *eligible)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn content(&self, id: ContentId) -> crate::Result<Option<ContentItem>> {
        Ok(self
            .tables
            .lock()
            .content
            .get(&id)
            .map(|(item, _)| item.clone()))
    }
}
