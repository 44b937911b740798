use std::{str::FromStr, time::Duration as StdDuration};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    FromRow, SqliteExecutor, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;
use trickle_common::{
    ContentId, DeadLetterId, EventType, Frequency, JobId, JobStatus, Preferences, Priority,
    SubscriberId, SubscriberRecord, SubscriberStatus,
};

use crate::{
    StoreError,
    config::SqliteConfig,
    r#trait::{
        ContentSource, DeadLetterStore, EmailLogStore, EventStore, MirrorStore, QueueStore,
        RateLimitStore, SubscriberSource,
    },
    types::{
        AnalyticsEvent, CLAIM_EXPIRED, Claim, ContentItem, DeadLetter, EmailLog, NewEmailLog,
        NewJob, QueueJob, QueueStats, RateLimitEntry, SubscriberMirror, error_log_line,
    },
};

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> crate::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidData(format!("Timestamp {ms} is out of range")))
}

fn opt_from_millis(ms: Option<i64>) -> crate::Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn int<T: TryFrom<i64>>(value: i64, field: &str) -> crate::Result<T> {
    T::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("{field} {value} is out of range")))
}

fn sql_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn split_error_log(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    subscriber_id: i64,
    recipient: String,
    content_id: Option<i64>,
    template: String,
    subject: String,
    body: String,
    status: String,
    attempts: i64,
    claims: i64,
    priority: i64,
    scheduled_at: i64,
    claimed_at: Option<i64>,
    sent_at: Option<i64>,
    error: Option<String>,
    error_log: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for QueueJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> crate::Result<Self> {
        Ok(Self {
            id: JobId(row.id),
            subscriber_id: SubscriberId(row.subscriber_id),
            recipient: row.recipient,
            content_id: row.content_id.map(ContentId),
            template: row.template,
            subject: row.subject,
            body: row.body,
            status: JobStatus::from_str(&row.status)?,
            attempts: int(row.attempts, "attempts")?,
            claims: int(row.claims, "claims")?,
            priority: Priority::new(row.priority),
            scheduled_at: from_millis(row.scheduled_at)?,
            claimed_at: opt_from_millis(row.claimed_at)?,
            sent_at: opt_from_millis(row.sent_at)?,
            error: row.error,
            error_log: split_error_log(&row.error_log),
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct DeadLetterRow {
    id: i64,
    job_id: i64,
    subscriber_id: i64,
    recipient: String,
    content_id: Option<i64>,
    template: String,
    subject: String,
    body: String,
    priority: i64,
    error_log: String,
    attempts: i64,
    created_at: i64,
    moved_at: i64,
    requeued_at: Option<i64>,
    requeued_job_id: Option<i64>,
}

impl TryFrom<DeadLetterRow> for DeadLetter {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> crate::Result<Self> {
        Ok(Self {
            id: DeadLetterId(row.id),
            job_id: JobId(row.job_id),
            subscriber_id: SubscriberId(row.subscriber_id),
            recipient: row.recipient,
            content_id: row.content_id.map(ContentId),
            template: row.template,
            subject: row.subject,
            body: row.body,
            priority: Priority::new(row.priority),
            error_log: split_error_log(&row.error_log),
            attempts: int(row.attempts, "attempts")?,
            created_at: from_millis(row.created_at)?,
            moved_at: from_millis(row.moved_at)?,
            requeued_at: opt_from_millis(row.requeued_at)?,
            requeued_job_id: row.requeued_job_id.map(JobId),
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    id: i64,
    job_id: Option<i64>,
    subscriber_id: i64,
    template: String,
    content_id: Option<i64>,
    status: String,
    detail: Option<String>,
    logged_at: i64,
}

impl TryFrom<LogRow> for EmailLog {
    type Error = StoreError;

    fn try_from(row: LogRow) -> crate::Result<Self> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id.map(JobId),
            subscriber_id: SubscriberId(row.subscriber_id),
            template: row.template,
            content_id: row.content_id.map(ContentId),
            status: row.status.parse()?,
            detail: row.detail,
            logged_at: from_millis(row.logged_at)?,
        })
    }
}

#[derive(FromRow)]
struct RateLimitRow {
    key: String,
    attempts: i64,
    expires_at: i64,
}

impl TryFrom<RateLimitRow> for RateLimitEntry {
    type Error = StoreError;

    fn try_from(row: RateLimitRow) -> crate::Result<Self> {
        Ok(Self {
            key: row.key,
            attempts: int(row.attempts, "attempts")?,
            expires_at: from_millis(row.expires_at)?,
        })
    }
}

#[derive(FromRow)]
struct MirrorRow {
    id: i64,
    email: String,
    status: String,
    frequency: String,
    preferences: String,
    next_send_at: Option<i64>,
    emails_sent: i64,
    last_sent_at: Option<i64>,
    source_updated_at: i64,
}

impl TryFrom<MirrorRow> for SubscriberMirror {
    type Error = StoreError;

    fn try_from(row: MirrorRow) -> crate::Result<Self> {
        Ok(Self {
            id: SubscriberId(row.id),
            email: row.email,
            status: row.status.parse()?,
            frequency: Frequency::parse_or_default(&row.frequency),
            preferences: Preferences::parse_list(&row.preferences),
            next_send_at: opt_from_millis(row.next_send_at)?,
            emails_sent: int(row.emails_sent, "emails_sent")?,
            last_sent_at: opt_from_millis(row.last_sent_at)?,
            source_updated_at: from_millis(row.source_updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct SubscriberRow {
    id: i64,
    email: String,
    status: String,
    verified: bool,
    frequency: String,
    preferences: String,
    consent_confirmed: bool,
    updated_at: i64,
}

impl TryFrom<SubscriberRow> for SubscriberRecord {
    type Error = StoreError;

    fn try_from(row: SubscriberRow) -> crate::Result<Self> {
        Ok(Self {
            id: SubscriberId(row.id),
            email: row.email,
            status: row.status.parse()?,
            verified: row.verified,
            frequency: Frequency::parse_or_default(&row.frequency),
            preferences: Preferences::parse_list(&row.preferences),
            consent_confirmed: row.consent_confirmed,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct ContentRow {
    id: i64,
    title: String,
    body: String,
    permalink: String,
}

impl From<ContentRow> for ContentItem {
    fn from(row: ContentRow) -> Self {
        Self {
            id: ContentId(row.id),
            title: row.title,
            body: row.body,
            permalink: row.permalink,
        }
    }
}

async fn insert_job<'e, E: SqliteExecutor<'e>>(
    executor: E,
    job: NewJob,
    now: DateTime<Utc>,
) -> crate::Result<JobId> {
    let scheduled_at = job.scheduled_at.unwrap_or(now);
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO queue_jobs \
             (subscriber_id, recipient, content_id, template, subject, body, priority, \
              scheduled_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(job.subscriber_id.get())
    .bind(job.recipient.trim())
    .bind(job.content_id.map(ContentId::get))
    .bind(&job.template)
    .bind(&job.subject)
    .bind(&job.body)
    .bind(i64::from(job.priority.get()))
    .bind(millis(scheduled_at))
    .bind(millis(now))
    .bind(millis(now))
    .fetch_one(executor)
    .await?;

    Ok(JobId(id))
}

/// SQLite backing store
///
/// One database file holds the pipeline's own tables together with the
/// authoritative `subscribers` and `content` tables it reads from. Status
/// transitions are single conditional `UPDATE`s, so several processes can
/// share the file.
#[derive(Debug, Clone)]
pub struct SqliteBackingStore {
    pool: SqlitePool,
}

impl SqliteBackingStore {
    /// Open (creating if needed) the database described by `config` and
    /// apply pending migrations.
    ///
    /// # Errors
    /// - If the path is rejected by [`SqliteConfig::validate`]
    /// - If the parent directory cannot be created
    /// - If the database cannot be opened or migrated
    pub async fn open(config: &SqliteConfig) -> crate::Result<Self> {
        config.validate()?;

        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(StdDuration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %config.path.display(), "Database opened");

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database, for tests.
    ///
    /// # Errors
    /// If the database cannot be created or migrated.
    pub async fn open_in_memory() -> crate::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> crate::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the error for a conditional update that matched no row.
    async fn transition_error(&self, id: JobId, expected: &'static str) -> StoreError {
        let status: Result<Option<String>, _> =
            sqlx::query_scalar("SELECT status FROM queue_jobs WHERE id = ?")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(Some(status)) => match JobStatus::from_str(&status) {
                Ok(found) => StoreError::InvalidTransition {
                    job: id,
                    expected,
                    found,
                },
                Err(e) => e.into(),
            },
            Ok(None) => StoreError::job_not_found(id),
            Err(e) => e.into(),
        }
    }

    /// Build the error for a claim-conditional update that matched no row.
    async fn claim_error(&self, claim: Claim) -> StoreError {
        let current: Result<Option<(String, i64)>, _> =
            sqlx::query_as("SELECT status, claims FROM queue_jobs WHERE id = ?")
                .bind(claim.job.get())
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(Some((status, claims)))
                if status == JobStatus::Processing.as_str()
                    && claims != i64::from(claim.generation) =>
            {
                StoreError::ClaimLost {
                    job: claim.job,
                    generation: claim.generation,
                }
            }
            Ok(_) => self.transition_error(claim.job, "processing").await,
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl QueueStore for SqliteBackingStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> crate::Result<JobId> {
        job.validate()?;
        insert_job(&self.pool, job, now).await
    }

    async fn get_job(&self, id: JobId) -> crate::Result<QueueJob> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM queue_jobs WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::job_not_found(id))?
            .try_into()
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> crate::Result<Vec<QueueJob>> {
        let now = millis(now);
        let rows = sqlx::query_as::<_, JobRow>(
            "UPDATE queue_jobs \
             SET status = 'processing', claims = claims + 1, claimed_at = ?, updated_at = ? \
             WHERE status = 'pending' AND id IN ( \
                 SELECT id FROM queue_jobs \
                 WHERE status = 'pending' AND scheduled_at <= ? \
                 ORDER BY priority, scheduled_at, id \
                 LIMIT ? \
             ) \
             RETURNING *",
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(QueueJob::try_from)
            .collect::<crate::Result<Vec<_>>>()?;
        // RETURNING order is unspecified
        jobs.sort_by_key(|job| (job.priority, job.scheduled_at, job.id));
        Ok(jobs)
    }

    async fn mark_sent(&self, claim: Claim, now: DateTime<Utc>) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET status = 'sent', sent_at = ?, claimed_at = NULL, error = NULL, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND claims = ?",
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(claim.job.get())
        .bind(i64::from(claim.generation))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.claim_error(claim).await);
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        claim: Claim,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<QueueJob> {
        let line = error_log_line(now, error);
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE queue_jobs \
             SET status = 'pending', attempts = attempts + 1, scheduled_at = ?, \
                 claimed_at = NULL, error = ?, updated_at = ?, \
                 error_log = CASE WHEN error_log = '' THEN ? ELSE error_log || char(10) || ? END \
             WHERE id = ? AND status = 'processing' AND claims = ? \
             RETURNING *",
        )
        .bind(millis(next_attempt_at))
        .bind(error)
        .bind(millis(now))
        .bind(&line)
        .bind(&line)
        .bind(claim.job.get())
        .bind(i64::from(claim.generation))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.claim_error(claim).await),
        }
    }

    async fn cancel(&self, id: JobId, reason: &str, now: DateTime<Utc>) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET status = 'cancelled', error = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(reason)
        .bind(millis(now))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "pending").await);
        }
        Ok(())
    }

    async fn cancel_claimed(
        &self,
        claim: Claim,
        reason: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET status = 'cancelled', claimed_at = NULL, error = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing' AND claims = ?",
        )
        .bind(reason)
        .bind(millis(now))
        .bind(claim.job.get())
        .bind(i64::from(claim.generation))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.claim_error(claim).await);
        }
        Ok(())
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> crate::Result<u64> {
        let line = error_log_line(now, CLAIM_EXPIRED);
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET status = 'pending', attempts = attempts + 1, claimed_at = NULL, \
                 error = ?, updated_at = ?, \
                 error_log = CASE WHEN error_log = '' THEN ? ELSE error_log || char(10) || ? END \
             WHERE status = 'processing' AND claimed_at < ?",
        )
        .bind(CLAIM_EXPIRED)
        .bind(millis(now))
        .bind(&line)
        .bind(&line)
        .bind(millis(claimed_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_jobs(&self, before: DateTime<Utc>) -> crate::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE status IN ('sent', 'cancelled') AND updated_at < ?",
        )
        .bind(millis(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> crate::Result<Vec<QueueJob>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM queue_jobs WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(sql_limit(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>("SELECT * FROM queue_jobs ORDER BY id DESC LIMIT ?")
                    .bind(sql_limit(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(QueueJob::try_from).collect()
    }

    async fn stats(&self) -> crate::Result<QueueStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = QueueStats {
            dead_letters: int(dead_letters, "count")?,
            ..QueueStats::default()
        };
        for (status, count) in counts {
            let count: u64 = int(count, "count")?;
            match JobStatus::from_str(&status)? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Sent => stats.sent = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
            }
        }
        Ok(stats)
    }

    async fn queued_content_ids(&self, subscriber: SubscriberId) -> crate::Result<Vec<ContentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT content_id FROM queue_jobs \
             WHERE subscriber_id = ? AND content_id IS NOT NULL \
               AND status IN ('pending', 'processing') \
             ORDER BY content_id",
        )
        .bind(subscriber.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContentId).collect())
    }
}

#[async_trait]
impl DeadLetterStore for SqliteBackingStore {
    async fn dead_letter(
        &self,
        claim: Claim,
        error: &str,
        now: DateTime<Utc>,
    ) -> crate::Result<DeadLetter> {
        let line = error_log_line(now, error);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE queue_jobs \
             SET status = 'failed', attempts = attempts + 1, claimed_at = NULL, \
                 error = ?, updated_at = ?, \
                 error_log = CASE WHEN error_log = '' THEN ? ELSE error_log || char(10) || ? END \
             WHERE id = ? AND status = 'processing' AND claims = ? \
             RETURNING *",
        )
        .bind(error)
        .bind(millis(now))
        .bind(&line)
        .bind(&line)
        .bind(claim.job.get())
        .bind(i64::from(claim.generation))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.claim_error(claim).await);
        };
        let job = QueueJob::try_from(row)?;

        let letter = sqlx::query_as::<_, DeadLetterRow>(
            "INSERT INTO dead_letters \
                 (job_id, subscriber_id, recipient, content_id, template, subject, body, \
                  priority, error_log, attempts, created_at, moved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING *",
        )
        .bind(job.id.get())
        .bind(job.subscriber_id.get())
        .bind(&job.recipient)
        .bind(job.content_id.map(ContentId::get))
        .bind(&job.template)
        .bind(&job.subject)
        .bind(&job.body)
        .bind(i64::from(job.priority.get()))
        .bind(job.error_log.join("\n"))
        .bind(i64::from(job.attempts))
        .bind(millis(job.created_at))
        .bind(millis(now))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        letter.try_into()
    }

    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> crate::Result<JobId> {
        let mut tx = self.pool.begin().await?;

        let letter: DeadLetter =
            sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM dead_letters WHERE id = ?")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::dead_letter_not_found(id))?
                .try_into()?;
        if letter.requeued_at.is_some() {
            return Err(StoreError::AlreadyRequeued(id));
        }

        let job_id = insert_job(&mut *tx, letter.to_new_job(), now).await?;

        let result = sqlx::query(
            "UPDATE dead_letters SET requeued_at = ?, requeued_job_id = ? \
             WHERE id = ? AND requeued_at IS NULL",
        )
        .bind(millis(now))
        .bind(job_id.get())
        .bind(id.get())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyRequeued(id));
        }

        tx.commit().await?;
        Ok(job_id)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> crate::Result<DeadLetter> {
        sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::dead_letter_not_found(id))?
            .try_into()
    }

    async fn list_dead_letters(&self, limit: usize) -> crate::Result<Vec<DeadLetter>> {
        sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM dead_letters ORDER BY id DESC LIMIT ?")
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DeadLetter::try_from)
            .collect()
    }
}

#[async_trait]
impl EmailLogStore for SqliteBackingStore {
    async fn append_log(&self, entry: NewEmailLog) -> crate::Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO email_log \
                 (job_id, subscriber_id, template, content_id, status, detail, logged_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id",
        )
        .bind(entry.job_id.map(JobId::get))
        .bind(entry.subscriber_id.get())
        .bind(&entry.template)
        .bind(entry.content_id.map(ContentId::get))
        .bind(entry.status.as_str())
        .bind(&entry.detail)
        .bind(millis(entry.logged_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn already_sent_content_ids(
        &self,
        subscriber: SubscriberId,
    ) -> crate::Result<Vec<ContentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT content_id FROM email_log \
             WHERE subscriber_id = ? AND status = 'sent' AND content_id IS NOT NULL \
             ORDER BY content_id",
        )
        .bind(subscriber.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContentId).collect())
    }

    async fn logs_for(&self, subscriber: SubscriberId) -> crate::Result<Vec<EmailLog>> {
        sqlx::query_as::<_, LogRow>("SELECT * FROM email_log WHERE subscriber_id = ? ORDER BY id")
            .bind(subscriber.get())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(EmailLog::try_from)
            .collect()
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> crate::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM email_log \
             WHERE logged_at < ? AND NOT (status = 'sent' AND content_id IS NOT NULL)",
        )
            .bind(millis(before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventStore for SqliteBackingStore {
    async fn insert_event(&self, event: AnalyticsEvent) -> crate::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO analytics_events \
                 (newsletter_id, queue_id, subscriber_id, event_type, target, event_hash, \
                  occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (event_hash) DO NOTHING",
        )
        .bind(event.newsletter_id.get())
        .bind(event.queue_id.map(JobId::get))
        .bind(event.subscriber_id.get())
        .bind(event.event_type.as_str())
        .bind(&event.target)
        .bind(&event.event_hash)
        .bind(millis(event.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_events(
        &self,
        newsletter: ContentId,
        event_type: EventType,
    ) -> crate::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM analytics_events WHERE newsletter_id = ? AND event_type = ?",
        )
        .bind(newsletter.get())
        .bind(event_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        int(count, "count")
    }
}

#[async_trait]
impl RateLimitStore for SqliteBackingStore {
    async fn hit(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> crate::Result<RateLimitEntry> {
        let now_ms = millis(now);
        let expires_at = millis(now + window);

        // SET expressions see the row as it was before the update
        sqlx::query_as::<_, RateLimitRow>(
            "INSERT INTO rate_limits (key, attempts, expires_at) VALUES (?, 1, ?) \
             ON CONFLICT (key) DO UPDATE SET \
                 attempts = CASE WHEN rate_limits.expires_at <= ? THEN 1 \
                                 ELSE rate_limits.attempts + 1 END, \
                 expires_at = CASE WHEN rate_limits.expires_at <= ? THEN excluded.expires_at \
                                   ELSE rate_limits.expires_at END \
             RETURNING key, attempts, expires_at",
        )
        .bind(key)
        .bind(expires_at)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn purge_rate_limits(&self, now: DateTime<Utc>) -> crate::Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= ?")
            .bind(millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MirrorStore for SqliteBackingStore {
    async fn get_mirror(&self, id: SubscriberId) -> crate::Result<Option<SubscriberMirror>> {
        sqlx::query_as::<_, MirrorRow>("SELECT * FROM subscriber_mirror WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(SubscriberMirror::try_from)
            .transpose()
    }

    async fn upsert_mirror(&self, row: SubscriberMirror) -> crate::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO subscriber_mirror \
                 (id, email, status, frequency, preferences, next_send_at, emails_sent, \
                  last_sent_at, source_updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
                 email = excluded.email, \
                 status = excluded.status, \
                 frequency = excluded.frequency, \
                 preferences = excluded.preferences, \
                 next_send_at = excluded.next_send_at, \
                 emails_sent = excluded.emails_sent, \
                 last_sent_at = excluded.last_sent_at, \
                 source_updated_at = excluded.source_updated_at \
             WHERE excluded.source_updated_at >= subscriber_mirror.source_updated_at",
        )
        .bind(row.id.get())
        .bind(&row.email)
        .bind(row.status.as_str())
        .bind(row.frequency.as_str())
        .bind(row.preferences.to_list())
        .bind(row.next_send_at.map(millis))
        .bind(i64::try_from(row.emails_sent).unwrap_or(i64::MAX))
        .bind(row.last_sent_at.map(millis))
        .bind(millis(row.source_updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_subscribers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> crate::Result<Vec<SubscriberMirror>> {
        sqlx::query_as::<_, MirrorRow>(
            "SELECT * FROM subscriber_mirror \
             WHERE status = 'active' AND next_send_at IS NOT NULL AND next_send_at <= ? \
             ORDER BY next_send_at, id \
             LIMIT ?",
        )
        .bind(millis(now))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SubscriberMirror::try_from)
        .collect()
    }

    async fn set_next_send(
        &self,
        id: SubscriberId,
        next: Option<DateTime<Utc>>,
    ) -> crate::Result<()> {
        let result = sqlx::query("UPDATE subscriber_mirror SET next_send_at = ? WHERE id = ?")
            .bind(next.map(millis))
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "Subscriber",
                id: id.get(),
            });
        }
        Ok(())
    }

    async fn set_mirror_status(
        &self,
        id: SubscriberId,
        status: SubscriberStatus,
    ) -> crate::Result<()> {
        let result = sqlx::query(
            "UPDATE subscriber_mirror \
             SET status = ?, next_send_at = CASE WHEN ? THEN next_send_at ELSE NULL END \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(status.is_active())
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "Subscriber",
                id: id.get(),
            });
        }
        Ok(())
    }

    async fn record_delivery(&self, id: SubscriberId, at: DateTime<Utc>) -> crate::Result<()> {
        sqlx::query(
            "UPDATE subscriber_mirror SET emails_sent = emails_sent + 1, last_sent_at = ? \
             WHERE id = ?",
        )
        .bind(millis(at))
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriberSource for SqliteBackingStore {
    async fn subscriber(&self, id: SubscriberId) -> crate::Result<Option<SubscriberRecord>> {
        sqlx::query_as::<_, SubscriberRow>(
            "SELECT id, email, status, verified, frequency, preferences, consent_confirmed, \
                    updated_at \
             FROM subscribers WHERE id = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .map(SubscriberRecord::try_from)
        .transpose()
    }
}

#[async_trait]
impl ContentSource for SqliteBackingStore {
    async fn eligible_content_ids(&self) -> crate::Result<Vec<ContentId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM content WHERE published = 1 AND ready = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(ContentId).collect())
    }

    async fn content(&self, id: ContentId) -> crate::Result<Option<ContentItem>> {
        Ok(sqlx::query_as::<_, ContentRow>(
            "SELECT id, title, body, permalink FROM content WHERE id = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .map(ContentItem::from))
    }
}
