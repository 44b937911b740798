//! Storage seams for the drip pipeline.
//!
//! Each table gets its own trait so callers can depend on exactly the part of
//! the store they touch. [`BackingStore`] bundles the tables the pipeline owns
//! and is implemented for anything that implements all of them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use trickle_common::{
    ContentId, DeadLetterId, EventType, JobId, JobStatus, SubscriberId, SubscriberRecord,
    SubscriberStatus,
};

use crate::types::{
    AnalyticsEvent, Claim, ContentItem, DeadLetter, EmailLog, NewEmailLog, NewJob, QueueJob, QueueStats,
    RateLimitEntry, SubscriberMirror,
};

/// The email queue.
///
/// Status changes are conditional on the current status. A transition that
/// finds the job elsewhere fails with
/// [`StoreError::InvalidTransition`](crate::StoreError::InvalidTransition).
/// Transitions out of `processing` also need the job's current [`Claim`], and
/// fail with [`StoreError::ClaimLost`](crate::StoreError::ClaimLost) when the
/// job has been claimed again since.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Insert a pending job.
    ///
    /// # Errors
    ///
    /// Fails validation when the recipient is not an address.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> crate::Result<JobId>;

    async fn get_job(&self, id: JobId) -> crate::Result<QueueJob>;

    /// Atomically move up to `limit` due pending jobs to processing.
    ///
    /// Jobs come back ordered by priority, then scheduled time, then id. A job
    /// is only ever returned to one caller, and each claim starts a new
    /// generation (see [`QueueJob::claim`]).
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> crate::Result<Vec<QueueJob>>;

    /// Processing to sent.
    async fn mark_sent(&self, claim: Claim, now: DateTime<Utc>) -> crate::Result<()>;

    /// Processing back to pending after a failed attempt.
    ///
    /// Increments the attempt counter and appends `error` to the job's error log.
    async fn reschedule(
        &self,
        claim: Claim,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<QueueJob>;

    /// Pending to cancelled, on an operator's say-so.
    async fn cancel(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> crate::Result<()>;

    /// Processing to cancelled, by the holder of the claim.
    async fn cancel_claimed(
        &self,
        claim: Claim,
        reason: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<()>;

    /// Return processing jobs claimed before `claimed_before` to pending.
    ///
    /// An expired claim counts as a failed attempt and is written to the
    /// job's error log.
    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<u64>;

    /// Delete sent and cancelled jobs last touched before `before`.
    async fn purge_jobs(&self, before: DateTime<Utc>) -> crate::Result<u64>;

    /// Newest first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> crate::Result<Vec<QueueJob>>;

    async fn stats(&self) -> crate::Result<QueueStats>;

    /// Content already waiting on the queue (pending or processing) for a subscriber.
    async fn queued_content_ids(&self, subscriber: SubscriberId) -> crate::Result<Vec<ContentId>>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync + std::fmt::Debug {
    /// Mark a processing job failed and record exactly one dead letter for it.
    ///
    /// Both writes happen together or not at all.
    async fn dead_letter(
        &self,
        claim: Claim,
        error: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<DeadLetter>;

    /// Put a dead letter's message back on the queue as a fresh job.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyRequeued`](crate::StoreError::AlreadyRequeued) on a
    /// second attempt.
    async fn requeue_dead_letter(&self, id: DeadLetterId, now: DateTime<Utc>)
    -> crate::Result<JobId>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> crate::Result<DeadLetter>;

    /// Newest first.
    async fn list_dead_letters(&self, limit: usize) -> crate::Result<Vec<DeadLetter>>;
}

#[async_trait]
pub trait EmailLogStore: Send + Sync + std::fmt::Debug {
    async fn append_log(&self, entry: NewEmailLog) -> crate::Result<i64>;

    /// Content ids with a `sent` log entry for the subscriber.
    async fn already_sent_content_ids(
        &self,
        subscriber: SubscriberId,
    ) -> crate::Result<Vec<ContentId>>;

    /// Oldest first.
    async fn logs_for(&self, subscriber: SubscriberId) -> crate::Result<Vec<EmailLog>>;

    /// Delete entries logged before `before`.
    ///
    /// `sent` entries with a content id are kept forever: they are what
    /// [`already_sent_content_ids`](Self::already_sent_content_ids) reads.
    async fn purge_logs(&self, before: DateTime<Utc>) -> crate::Result<u64>;
}

#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// Returns `false` if an event with the same hash already exists.
    async fn insert_event(&self, event: AnalyticsEvent) -> crate::Result<bool>;

    async fn count_events(
        &self,
        newsletter: ContentId,
        event_type: EventType,
    ) -> crate::Result<u64>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync + std::fmt::Debug {
    /// Count one attempt against `key`.
    ///
    /// An expired entry starts a new window of length `window` at `now`.
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> crate::Result<RateLimitEntry>;

    async fn purge_rate_limits(&self, now: DateTime<Utc>) -> crate::Result<u64>;
}

/// The scheduler's subscriber mirror.
#[async_trait]
pub trait MirrorStore: Send + Sync + std::fmt::Debug {
    async fn get_mirror(&self, id: SubscriberId) -> crate::Result<Option<SubscriberMirror>>;

    /// Write `row` unless the stored row was copied from a newer source record.
    ///
    /// Returns whether the row was written.
    async fn upsert_mirror(&self, row: SubscriberMirror) -> crate::Result<bool>;

    /// Active subscribers whose next send time has passed, soonest first.
    async fn due_subscribers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> crate::Result<Vec<SubscriberMirror>>;

    async fn set_next_send(
        &self,
        id: SubscriberId,
        next: Option<DateTime<Utc>>,
    ) -> crate::Result<()>;

    /// Leaving the active state clears the next send time.
    async fn set_mirror_status(
        &self,
        id: SubscriberId,
        status: SubscriberStatus,
    ) -> crate::Result<()>;

    /// Bump the sent counter after a delivered drip email.
    async fn record_delivery(&self, id: SubscriberId, at: DateTime<Utc>) -> crate::Result<()>;
}

/// Read access to the authoritative subscriber records.
#[async_trait]
pub trait SubscriberSource: Send + Sync + std::fmt::Debug {
    async fn subscriber(&self, id: SubscriberId) -> crate::Result<Option<SubscriberRecord>>;
}

/// Read access to published drip content.
#[async_trait]
pub trait ContentSource: Send + Sync + std::fmt::Debug {
    /// Ids of published, ready content in ascending order.
    async fn eligible_content_ids(&self) -> crate::Result<Vec<ContentId>>;

    async fn content(&self, id: ContentId) -> crate::Result<Option<ContentItem>>;
}

/// Everything the pipeline itself owns.
pub trait BackingStore:
    QueueStore + DeadLetterStore + EmailLogStore + EventStore + RateLimitStore + MirrorStore
{
}

impl<T> BackingStore for T where
    T: QueueStore + DeadLetterStore + EmailLogStore + EventStore + RateLimitStore + MirrorStore
{
}
