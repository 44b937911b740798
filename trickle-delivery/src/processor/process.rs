//! Queue processing logic for delivery attempts

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use trickle_common::{LogStatus, SendingConfig, outgoing};
use trickle_store::{
    BackingStore, DeadLetterStore, EmailLogStore, MirrorStore, NewEmailLog, QueueJob, QueueStore,
};

use super::{QueueProcessor, not_initialized};
use crate::{
    analytics::NewEvent,
    error::{DeliveryError, TemporaryError},
    policy::RetryPolicy,
    transport::{MailTransport, OutboundMessage},
};

/// What one processor tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Suppressed by demo mode or as duplicates
    pub cancelled: usize,
    /// Jobs whose outcome could not be recorded; they stay claimed until released
    pub errors: usize,
}

/// Final state of one claimed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Retried,
    DeadLettered,
    Cancelled,
}

impl ProcessReport {
    const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

impl QueueProcessor {
    /// Process one batch of due jobs
    ///
    /// 1. Does nothing at all while sending is paused
    /// 2. Claims up to `processor_batch_size` due jobs, highest priority first,
    ///    but never more than can be sent before their claims go stale
    /// 3. Cancels every claimed job in demo mode without touching the transport
    /// 4. Cancels drip jobs whose content the subscriber already received
    /// 5. Dead-letters jobs whose budget was spent by expired claims
    /// 6. Sends the rest, retrying or dead-lettering failures
    ///
    /// A failure to record one job's outcome is logged and counted; the rest
    /// of the batch still runs.
    ///
    /// # Errors
    ///
    /// If the processor was never initialised, or the claim itself fails.
    pub async fn tick(
        &self,
        config: &SendingConfig,
        now: DateTime<Utc>,
    ) -> Result<ProcessReport, DeliveryError> {
        let store = self.store()?;
        let transport = self.transport.as_ref().ok_or_else(not_initialized)?;

        if config.pause_all_sending {
            outgoing!(level = INFO, "Sending is paused, leaving the queue untouched");
            return Ok(ProcessReport::default());
        }

        let batch = claim_batch_size(config, self.transport_timeout());
        if batch < config.processor_batch_size {
            tracing::debug!(
                batch,
                configured = config.processor_batch_size,
                "Batch capped to finish within the stuck timeout"
            );
        }

        let jobs = store.claim_due(now, batch).await?;
        let mut report = ProcessReport {
            claimed: jobs.len(),
            ..ProcessReport::default()
        };

        if jobs.is_empty() {
            return Ok(report);
        }

        let policy = RetryPolicy::new(config.max_attempts, self.backoff.clone());

        for job in jobs {
            let job_id = job.id;
            match self.process_job(store, transport, &policy, config, job, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) if e.is_lost_race() => {
                    tracing::debug!(job_id = %job_id, error = %e, "Job moved on by another processor");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record delivery outcome");
                }
            }
        }

        Ok(report)
    }

    async fn process_job(
        &self,
        store: &Arc<dyn BackingStore>,
        transport: &Arc<dyn MailTransport>,
        policy: &RetryPolicy,
        config: &SendingConfig,
        job: QueueJob,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DeliveryError> {
        if config.demo_mode {
            return cancel(store, &job, "Demo mode: delivery suppressed", now).await;
        }

        if let Some(content) = job.content_id
            && store
                .already_sent_content_ids(job.subscriber_id)
                .await?
                .contains(&content)
        {
            let reason = format!(
                "Content {content} was already delivered to subscriber {}",
                job.subscriber_id
            );
            return cancel(store, &job, &reason, now).await;
        }

        if job.attempts > 0 && !policy.should_retry(job.attempts) {
            let reason = format!(
                "Retry budget spent after {} attempts, the last ending with: {}",
                job.attempts,
                job.error.as_deref().unwrap_or("unknown error")
            );
            return exhausted(store, &job, &reason, now).await;
        }

        let message = OutboundMessage::from(&job);
        let timeout = self.transport_timeout();
        let result = match tokio::time::timeout(timeout, transport.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(TemporaryError::Timeout(timeout).into()),
        };

        match result {
            Ok(()) => self.delivered(store, &job, now).await,
            Err(e) => failed(store, policy, &job, &e, now).await,
        }
    }

    async fn delivered(
        &self,
        store: &Arc<dyn BackingStore>,
        job: &QueueJob,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DeliveryError> {
        store.mark_sent(job.claim(), now).await?;

        outgoing!(
            level = INFO,
            "Delivered job {} ({}) to {}",
            job.id,
            job.template,
            job.recipient
        );

        store
            .append_log(NewEmailLog::for_job(job, LogStatus::Sent, None, now))
            .await?;

        // Bookkeeping below never undoes a delivery
        if let Err(e) = store.record_delivery(job.subscriber_id, now).await {
            tracing::warn!(subscriber_id = %job.subscriber_id, error = %e, "Failed to update send counters");
        }

        if let (Some(content), Some(analytics)) = (job.content_id, &self.analytics) {
            let event = NewEvent::new(trickle_common::EventType::Sent, content, job.subscriber_id)
                .for_job(job.id);
            if let Err(e) = analytics.record(event, now).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to record sent event");
            }
        }

        Ok(Outcome::Sent)
    }
}

async fn cancel(
    store: &Arc<dyn BackingStore>,
    job: &QueueJob,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, DeliveryError> {
    store.cancel_claimed(job.claim(), reason, now).await?;
    outgoing!(level = INFO, "Cancelled job {}: {reason}", job.id);

    store
        .append_log(NewEmailLog::for_job(
            job,
            LogStatus::Cancelled,
            Some(reason.to_string()),
            now,
        ))
        .await?;

    Ok(Outcome::Cancelled)
}

async fn failed(
    store: &Arc<dyn BackingStore>,
    policy: &RetryPolicy,
    job: &QueueJob,
    error: &DeliveryError,
    now: DateTime<Utc>,
) -> Result<Outcome, DeliveryError> {
    let attempts = job.attempts.saturating_add(1);
    let reason = error.to_string();

    if !error.is_permanent() && policy.should_retry(attempts) {
        let next_attempt_at = policy.next_attempt_at(attempts, now);
        store.reschedule(job.claim(), &reason, next_attempt_at, now).await?;

        tracing::warn!(
            job_id = %job.id,
            attempt = attempts,
            remaining = policy.remaining_attempts(attempts),
            next_attempt_at = %next_attempt_at,
            error = %reason,
            "Delivery failed, will retry"
        );
        return Ok(Outcome::Retried);
    }

    let letter = store.dead_letter(job.claim(), &reason, now).await?;
    tracing::error!(
        job_id = %job.id,
        dead_letter_id = %letter.id,
        attempts = letter.attempts,
        error = %reason,
        "Delivery failed permanently, moved to dead letters"
    );

    store
        .append_log(NewEmailLog::for_job(job, LogStatus::Failed, Some(reason), now))
        .await?;

    Ok(Outcome::DeadLettered)
}

async fn exhausted(
    store: &Arc<dyn BackingStore>,
    job: &QueueJob,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, DeliveryError> {
    let letter = store.dead_letter(job.claim(), reason, now).await?;
    tracing::error!(
        job_id = %job.id,
        dead_letter_id = %letter.id,
        attempts = job.attempts,
        "Retry budget already spent, moved to dead letters without another send"
    );

    store
        .append_log(NewEmailLog::for_job(
            job,
            LogStatus::Failed,
            Some(reason.to_string()),
            now,
        ))
        .await?;

    Ok(Outcome::DeadLettered)
}

/// Largest batch whose worst case, every send hitting the transport timeout,
/// still ends before the first claim in it can be released as stuck.
fn claim_batch_size(config: &SendingConfig, transport_timeout: Duration) -> usize {
    let stuck = config.stuck_timeout().to_std().unwrap_or(Duration::ZERO);
    let per_send = transport_timeout.max(Duration::from_secs(1));

    // One send of headroom for the store round trips around each send
    let fits = (stuck.as_secs() / per_send.as_secs()).saturating_sub(1).max(1);
    let fits = usize::try_from(fits).unwrap_or(usize::MAX);

    config.processor_batch_size.min(fits)
}
