//! Row types held by the store backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trickle_common::{
    ContentId, DeadLetterId, EventType, Frequency, JobId, JobStatus, LogStatus, Preferences,
    Priority, SubscriberId, SubscriberRecord, SubscriberStatus,
};

use crate::StoreError;

/// One outbound email attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub subscriber_id: SubscriberId,
    /// Address snapshot taken at enqueue time
    pub recipient: String,
    pub content_id: Option<ContentId>,
    pub template: String,
    pub subject: String,
    pub body: String,
    pub status: JobStatus,
    /// Failed delivery attempts so far, including expired claims
    pub attempts: u32,
    /// Times the job has been claimed; the generation of the current claim
    pub claims: u32,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    /// Set while the job is [`JobStatus::Processing`]
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Most recent failure or cancellation reason
    pub error: Option<String>,
    /// One timestamped line per failed attempt, oldest first
    pub error_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    /// Claimable: pending and due.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// The claim this copy of the job was handed out under.
    #[must_use]
    pub const fn claim(&self) -> Claim {
        Claim {
            job: self.id,
            generation: self.claims,
        }
    }
}

/// Proof of one claim on a job, as returned by
/// [`QueueStore::claim_due`](crate::QueueStore::claim_due).
///
/// Every transition out of `processing` must present the current claim. Once
/// a stuck job is released and claimed again, older claims are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    pub job: JobId,
    pub generation: u32,
}

/// A job to be placed on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub subscriber_id: SubscriberId,
    pub recipient: String,
    pub content_id: Option<ContentId>,
    pub template: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    /// `None` schedules the job for immediate delivery
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    #[must_use]
    pub fn new(
        subscriber_id: SubscriberId,
        recipient: impl Into<String>,
        template: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subscriber_id,
            recipient: recipient.into(),
            content_id: None,
            template: template.into(),
            subject: subject.into(),
            body: body.into(),
            priority: Priority::default(),
            scheduled_at: None,
        }
    }

    #[must_use]
    pub const fn with_content(mut self, content_id: ContentId) -> Self {
        self.content_id = Some(content_id);
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Reject jobs that can never be delivered.
    pub fn validate(&self) -> crate::Result<()> {
        let recipient = self.recipient.trim();
        if recipient.is_empty() {
            return Err(StoreError::Validation(format!(
                "Job for subscriber {} has no recipient",
                self.subscriber_id
            )));
        }
        if !recipient.contains('@') {
            return Err(StoreError::Validation(format!(
                "Recipient {recipient:?} is not an email address"
            )));
        }
        if self.template.trim().is_empty() {
            return Err(StoreError::Validation("Job has no template name".to_string()));
        }
        Ok(())
    }

    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> QueueJob {
        QueueJob {
            id,
            subscriber_id: self.subscriber_id,
            recipient: self.recipient.trim().to_string(),
            content_id: self.content_id,
            template: self.template,
            subject: self.subject,
            body: self.body,
            status: JobStatus::Pending,
            attempts: 0,
            claims: 0,
            priority: self.priority,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            claimed_at: None,
            sent_at: None,
            error: None,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal failure record for a job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub subscriber_id: SubscriberId,
    pub recipient: String,
    pub content_id: Option<ContentId>,
    pub template: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub error_log: Vec<String>,
    pub attempts: u32,
    /// When the original job was created
    pub created_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
    /// Set once by a manual requeue
    pub requeued_at: Option<DateTime<Utc>>,
    pub requeued_job_id: Option<JobId>,
}

impl DeadLetter {
    pub(crate) fn from_job(id: DeadLetterId, job: &QueueJob, moved_at: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id: job.id,
            subscriber_id: job.subscriber_id,
            recipient: job.recipient.clone(),
            content_id: job.content_id,
            template: job.template.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
            priority: job.priority,
            error_log: job.error_log.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            moved_at,
            requeued_at: None,
            requeued_job_id: None,
        }
    }

    /// A fresh job carrying the same message.
    #[must_use]
    pub fn to_new_job(&self) -> NewJob {
        NewJob {
            subscriber_id: self.subscriber_id,
            recipient: self.recipient.clone(),
            content_id: self.content_id,
            template: self.template.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            priority: self.priority,
            scheduled_at: None,
        }
    }
}

/// Immutable record of a completed send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: i64,
    pub job_id: Option<JobId>,
    pub subscriber_id: SubscriberId,
    pub template: String,
    pub content_id: Option<ContentId>,
    pub status: LogStatus,
    pub detail: Option<String>,
    pub logged_at: DateTime<Utc>,
}

impl EmailLog {
    /// A delivered drip letter; never purged.
    #[must_use]
    pub fn records_delivered_content(&self) -> bool {
        self.status == LogStatus::Sent && self.content_id.is_some()
    }
}

/// An email log row to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmailLog {
    pub job_id: Option<JobId>,
    pub subscriber_id: SubscriberId,
    pub template: String,
    pub content_id: Option<ContentId>,
    pub status: LogStatus,
    pub detail: Option<String>,
    pub logged_at: DateTime<Utc>,
}

impl NewEmailLog {
    /// Log row describing the final outcome of `job`.
    #[must_use]
    pub fn for_job(
        job: &QueueJob,
        status: LogStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Some(job.id),
            subscriber_id: job.subscriber_id,
            template: job.template.clone(),
            content_id: job.content_id,
            status,
            detail,
            logged_at: at,
        }
    }
}

/// One analytics observation, unique by `event_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub newsletter_id: ContentId,
    pub queue_id: Option<JobId>,
    pub subscriber_id: SubscriberId,
    pub event_type: EventType,
    pub target: Option<String>,
    pub event_hash: String,
    pub occurred_at: DateTime<Utc>,
}

/// Attempt counter for one hashed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub key: String,
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
}

impl RateLimitEntry {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The scheduler's copy of a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberMirror {
    pub id: SubscriberId,
    pub email: String,
    pub status: SubscriberStatus,
    pub frequency: Frequency,
    pub preferences: Preferences,
    /// Only meaningful while `status` is active
    pub next_send_at: Option<DateTime<Utc>>,
    pub emails_sent: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// `updated_at` of the owning record this row was copied from
    pub source_updated_at: DateTime<Utc>,
}

impl SubscriberMirror {
    /// Whether the mirror disagrees with the owning record on anything it copies.
    #[must_use]
    pub fn diverges_from(&self, record: &SubscriberRecord) -> bool {
        self.email != record.email
            || self.status != record.status
            || self.frequency != record.frequency
            || self.preferences != record.preferences
    }
}

/// A piece of drip content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub title: String,
    pub body: String,
    pub permalink: String,
}

/// Row counts per job status, plus the dead-letter total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_letters: u64,
}

impl QueueStats {
    pub(crate) const fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Sent => self.sent += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Error recorded against a job whose claim was released by maintenance.
pub const CLAIM_EXPIRED: &str = "Claim expired before an outcome was recorded";

/// Format one error-log line. Newlines are flattened so each attempt stays on one line.
#[must_use]
pub fn error_log_line(at: DateTime<Utc>, error: &str) -> String {
    format!(
        "{} {}",
        at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        error.replace(['\r', '\n'], " ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_validation() {
        let job = NewJob::new(SubscriberId(1), "reader@example.com", "letter", "s", "b");
        assert!(job.validate().is_ok());

        let job = NewJob::new(SubscriberId(1), "  ", "letter", "s", "b");
        assert!(matches!(job.validate(), Err(StoreError::Validation(_))));

        let job = NewJob::new(SubscriberId(1), "not-an-address", "letter", "s", "b");
        assert!(matches!(job.validate(), Err(StoreError::Validation(_))));

        let job = NewJob::new(SubscriberId(1), "reader@example.com", "", "s", "b");
        assert!(matches!(job.validate(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_new_job_defaults_to_now() {
        let now = Utc::now();
        let job = NewJob::new(SubscriberId(1), "reader@example.com", "letter", "s", "b")
            .with_content(ContentId(101))
            .into_job(JobId(1), now);
        assert_eq!(job.scheduled_at, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.content_id, Some(ContentId(101)));
        assert!(job.is_due(now));
        assert!(!job.is_due(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_error_log_line_is_single_line() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let line = error_log_line(at, "connection reset\nby peer");
        assert_eq!(line, "2023-11-14T22:13:20Z connection reset by peer");
    }
}
