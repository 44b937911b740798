//! Operator access to dead letters.
//!
//! Dead letters are never edited. Reprocessing one builds a fresh pending job
//! from it and stamps the dead letter with when and as which job it went back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use trickle_common::{DeadLetterId, JobId, internal};
use trickle_store::{BackingStore, DeadLetter, DeadLetterStore};

use crate::error::DeliveryError;

#[derive(Debug, Clone)]
pub struct DeadLetterService {
    store: Arc<dyn BackingStore>,
}

impl DeadLetterService {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeliveryError> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetter, DeliveryError> {
        Ok(self.store.get_dead_letter(id).await?)
    }

    /// Put the dead letter's message back on the queue with a clean attempt count.
    ///
    /// # Errors
    ///
    /// Fails with a lost-race store error if the dead letter was already requeued.
    pub async fn requeue(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> Result<JobId, DeliveryError> {
        let job_id = self.store.requeue_dead_letter(id, now).await?;
        internal!(level = INFO, "Dead letter {id} requeued as job {job_id}");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use trickle_common::{JobStatus, SubscriberId};
    use trickle_store::{MemoryBackingStore, NewJob, QueueStore};

    use super::*;

    #[tokio::test]
    async fn test_requeue_once() {
        let store = Arc::new(MemoryBackingStore::new());
        let now = Utc::now();

        store
            .enqueue(
                NewJob::new(SubscriberId(1), "reader@example.com", "letter", "Hi", "Body"),
                now,
            )
            .await
            .expect("enqueue");
        let claim = store.claim_due(now, 10).await.expect("claim")[0].claim();
        let letter = store
            .dead_letter(claim, "550 mailbox unavailable", now)
            .await
            .expect("dead letter");

        let service = DeadLetterService::new(store.clone());
        assert_eq!(service.list(10).await.expect("list").len(), 1);

        let requeued = service.requeue(letter.id, now).await.expect("requeue");
        let job = store.get_job(requeued).await.expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.body, "Body");

        let err = service
            .requeue(letter.id, now)
            .await
            .expect_err("Second requeue should fail");
        assert!(err.is_lost_race());

        let letter = service.get(letter.id).await.expect("get");
        assert_eq!(letter.requeued_job_id, Some(requeued));
        assert_eq!(letter.error_log.len(), 1);
    }
}
