//! One scheduling pass

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use trickle_common::{
    ContentId, Preference, Priority, SendingConfig, SubscriberRecord,
    job::templates,
    template::{Vars, render},
};
use trickle_store::{
    ContentItem, ContentSource, EmailLogStore, MirrorStore, NewJob, QueueStore, SubscriberMirror,
};

use super::{DripScheduler, Parts, reconcile::Reconciliation};
use crate::error::SchedulerError;

/// Marker embedded at the top of every drip body, tying the mail back to its content.
#[must_use]
pub fn content_marker(id: ContentId) -> String {
    format!("<!-- trickle:content:{id} -->")
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Due mirror rows examined
    pub scanned: usize,
    /// Letters queued
    pub enqueued: usize,
    /// "All caught up" notices queued
    pub caught_up: usize,
    /// Live subscribers advanced without a job (preferences, re-consent)
    pub skipped: usize,
    /// Mirror rows rewritten from the owning record; none of them is mailed this pass
    pub corrected: usize,
    /// Subscribers whose step failed; they are still advanced
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Enqueued(ContentId),
    CaughtUp,
    Skipped(&'static str),
}

impl DripScheduler {
    /// Run one scheduling pass
    ///
    /// 1. Loads up to `scheduler_batch_size` due mirror rows, soonest first
    /// 2. Reconciles each against its owning record, dropping any that are
    ///    no longer live and skipping any that had to be rewritten
    /// 3. For each remaining subscriber queues one unseen letter, or an "all
    ///    caught up" notice when none is left, unless preferences or
    ///    re-consent rule the subscriber out
    /// 4. Advances every live subscriber's next send time from `now`
    ///
    /// A subscriber whose step fails is logged and still advanced, so a row
    /// that keeps failing cannot hold the head of the due list.
    ///
    /// # Errors
    ///
    /// If the scheduler was never initialised, or the due rows cannot be listed.
    pub async fn tick(
        &self,
        config: &SendingConfig,
        now: DateTime<Utc>,
    ) -> Result<TickReport, SchedulerError> {
        let parts = self.parts()?;
        let due = parts
            .store
            .due_subscribers(now, config.scheduler_batch_size)
            .await?;

        let mut report = TickReport {
            scanned: due.len(),
            ..TickReport::default()
        };

        let mut live = Vec::with_capacity(due.len());
        for row in &due {
            match self.reconcile(row, now).await {
                Ok(Reconciliation::Live {
                    row,
                    record,
                    corrected: false,
                }) => live.push((row, record)),
                Ok(Reconciliation::Live { row, record, .. }) => {
                    report.corrected += 1;
                    if let Err(e) = advance(&parts, &row, &record, now).await {
                        tracing::warn!(subscriber_id = %row.id, error = %e, "Failed to advance corrected subscriber");
                    }
                }
                Ok(Reconciliation::Dropped { .. }) => report.corrected += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(subscriber_id = %row.id, error = %e, "Failed to reconcile subscriber");
                }
            }
        }

        for (row, record) in live {
            let step = self.schedule_one(&parts, config, &record, now).await;
            let advanced = advance(&parts, &row, &record, now).await;

            match step {
                Ok(Step::Enqueued(content)) => {
                    report.enqueued += 1;
                    tracing::debug!(subscriber_id = %row.id, content_id = %content, "Queued letter");
                }
                Ok(Step::CaughtUp) => {
                    report.caught_up += 1;
                    tracing::debug!(subscriber_id = %row.id, "Subscriber is caught up");
                }
                Ok(Step::Skipped(reason)) => {
                    report.skipped += 1;
                    tracing::debug!(subscriber_id = %row.id, reason, "Skipped subscriber");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(subscriber_id = %row.id, error = %e, "Failed to schedule subscriber");
                }
            }

            if let Err(e) = advanced {
                tracing::error!(subscriber_id = %row.id, error = %e, "Failed to advance next send");
            }
        }

        Ok(report)
    }

    async fn schedule_one(
        &self,
        parts: &Parts<'_>,
        config: &SendingConfig,
        record: &SubscriberRecord,
        now: DateTime<Utc>,
    ) -> Result<Step, SchedulerError> {
        if !record.preferences.contains(Preference::Letters) {
            return Ok(Step::Skipped("not subscribed to letters"));
        }
        if config.reconsent_required && !record.consent_confirmed {
            return Ok(Step::Skipped("re-consent outstanding"));
        }
        self.enqueue_next(parts, record, now).await
    }

    async fn enqueue_next(
        &self,
        parts: &Parts<'_>,
        record: &SubscriberRecord,
        now: DateTime<Utc>,
    ) -> Result<Step, SchedulerError> {
        let pool = self.pool.get(parts.content.as_ref(), now).await?;

        let mut seen: HashSet<ContentId> = parts
            .store
            .already_sent_content_ids(record.id)
            .await?
            .into_iter()
            .collect();
        seen.extend(parts.store.queued_content_ids(record.id).await?);

        let mut candidates: Vec<ContentId> =
            pool.iter().copied().filter(|id| !seen.contains(id)).collect();

        let unsubscribe_url = self.templates.unsubscribe_url(record.id);

        if candidates.is_empty() {
            let vars = Vars {
                subscriber_email: &record.email,
                unsubscribe_url: &unsubscribe_url,
                ..Vars::default()
            };
            let (subject, body) = self.templates.caught_up.render(&vars);
            let job = NewJob::new(
                record.id,
                record.email.clone(),
                templates::CAUGHT_UP,
                subject,
                body,
            )
            .with_priority(Priority::NORMAL);

            parts.store.enqueue(job, now).await?;
            return Ok(Step::CaughtUp);
        }

        candidates.shuffle(&mut rand::rng());

        for id in &candidates {
            let Some(item) = parts.content.content(*id).await? else {
                // Unpublished since the pool was cached
                self.pool.invalidate();
                continue;
            };

            let job = self.letter_job(record, &item, &unsubscribe_url);
            parts.store.enqueue(job, now).await?;
            return Ok(Step::Enqueued(item.id));
        }

        Err(SchedulerError::ContentUnavailable {
            subscriber: record.id,
            tried: candidates,
        })
    }

    fn letter_job(&self, record: &SubscriberRecord, item: &ContentItem, unsubscribe_url: &str) -> NewJob {
        let vars = Vars {
            subscriber_email: &record.email,
            title: &item.title,
            permalink: &item.permalink,
            unsubscribe_url,
        };

        let (subject, footer) = self.templates.letter.render(&vars);
        let body = format!(
            "{}\n{}\n{footer}",
            content_marker(item.id),
            render(&item.body, &vars)
        );

        NewJob::new(record.id, record.email.clone(), templates::LETTER, subject, body)
            .with_content(item.id)
            .with_priority(Priority::NORMAL)
    }
}

/// Exactly one advance per due, live subscriber per pass, whatever its step did.
async fn advance(
    parts: &Parts<'_>,
    row: &SubscriberMirror,
    record: &SubscriberRecord,
    now: DateTime<Utc>,
) -> Result<(), SchedulerError> {
    let next = record.frequency.next_after(now);
    parts.store.set_next_send(row.id, Some(next)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_marker() {
        assert_eq!(content_marker(ContentId(101)), "<!-- trickle:content:101 -->");
    }
}
