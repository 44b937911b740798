#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use trickle_common::{
    ContentId, EventType, Frequency, JobStatus, LogStatus, Preferences, Priority, SendingConfig,
    SubscriberId, SubscriberStatus,
};
use trickle_delivery::{
    BackoffStrategy, MailTransport, ProcessReport, QueueProcessor,
    transport::testing::{FailingTransport, RecordingTransport, StalledTransport},
};
use trickle_store::{
    BackingStore, DeadLetterStore, EmailLogStore, EventStore, MemoryBackingStore, MirrorStore,
    NewEmailLog, NewJob, QueueStore, SqliteBackingStore, SubscriberMirror,
};

fn at(minutes: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
}

fn letter(subscriber: i64, content: i64) -> NewJob {
    NewJob::new(
        SubscriberId(subscriber),
        format!("reader{subscriber}@example.com"),
        "letter",
        "A letter",
        format!("<!-- trickle:content:{content} -->Dear reader"),
    )
    .with_content(ContentId(content))
}

fn processor(store: Arc<dyn BackingStore>, transport: Arc<dyn MailTransport>) -> QueueProcessor {
    let mut processor = QueueProcessor::default();
    processor.backoff = BackoffStrategy::Fixed { delay_secs: 60 };
    processor.init(store, transport);
    processor
}

fn mirror(id: i64) -> SubscriberMirror {
    SubscriberMirror {
        id: SubscriberId(id),
        email: format!("reader{id}@example.com"),
        status: SubscriberStatus::Active,
        frequency: Frequency::Weekly,
        preferences: Preferences::all(),
        next_send_at: Some(at(10_000)),
        emails_sent: 0,
        last_sent_at: None,
        source_updated_at: at(0),
    }
}

#[tokio::test]
async fn successful_delivery_records_everything() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    store.upsert_mirror(mirror(9)).await.unwrap();
    let id = store.enqueue(letter(9, 101), at(0)).await.unwrap();

    let report = processor
        .tick(&SendingConfig::default(), at(1))
        .await
        .unwrap();
    assert_eq!(
        report,
        ProcessReport {
            claimed: 1,
            sent: 1,
            ..ProcessReport::default()
        }
    );

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "reader9@example.com");

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.sent_at, Some(at(1)));

    let logs = store.logs_for(SubscriberId(9)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Sent);
    assert_eq!(logs[0].content_id, Some(ContentId(101)));

    let row = store.get_mirror(SubscriberId(9)).await.unwrap().unwrap();
    assert_eq!(row.emails_sent, 1);
    assert_eq!(row.last_sent_at, Some(at(1)));

    assert_eq!(
        store
            .count_events(ContentId(101), EventType::Sent)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn higher_priority_jobs_go_first() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    store.enqueue(letter(1, 101), at(0)).await.unwrap();
    store
        .enqueue(
            NewJob::new(
                SubscriberId(2),
                "new@example.com",
                "verification",
                "Confirm",
                "Click",
            )
            .with_priority(Priority::URGENT),
            at(0),
        )
        .await
        .unwrap();

    let config = SendingConfig {
        processor_batch_size: 1,
        ..SendingConfig::default()
    };

    processor.tick(&config, at(1)).await.unwrap();
    assert_eq!(transport.sent()[0].recipient, "new@example.com");

    processor.tick(&config, at(1)).await.unwrap();
    assert_eq!(transport.sent()[1].recipient, "reader1@example.com");
}

async fn retry_budget_is_enforced(store: Arc<dyn BackingStore>) {
    let transport = FailingTransport::temporary("451 try later");
    let processor = processor(store.clone(), Arc::new(transport.clone()));
    let config = SendingConfig::default();

    let id = store.enqueue(letter(3, 101), at(0)).await.unwrap();

    let report = processor.tick(&config, at(0)).await.unwrap();
    assert_eq!(report.retried, 1);
    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.scheduled_at, at(1));

    // Not due yet
    let report = processor.tick(&config, at(0)).await.unwrap();
    assert_eq!(report.claimed, 0);

    let report = processor.tick(&config, at(1)).await.unwrap();
    assert_eq!(report.retried, 1);

    let report = processor.tick(&config, at(2)).await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_log.len(), 3);

    let letters = store.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, id);
    assert_eq!(letters[0].attempts, 3);

    // Never selected again
    let report = processor.tick(&config, at(1_000)).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(transport.calls(), 3);

    let logs = store.logs_for(SubscriberId(3)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dead_letters, 1);
}

#[tokio::test]
async fn retry_budget_is_enforced_in_memory() {
    retry_budget_is_enforced(Arc::new(MemoryBackingStore::new())).await;
}

#[tokio::test]
async fn retry_budget_is_enforced_in_sqlite() {
    retry_budget_is_enforced(Arc::new(SqliteBackingStore::open_in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = FailingTransport::permanent("550 no such user");
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    let id = store.enqueue(letter(4, 101), at(0)).await.unwrap();
    let report = processor
        .tick(&SendingConfig::default(), at(0))
        .await
        .unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(transport.calls(), 1);

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("550 no such user"));
}

#[tokio::test]
async fn demo_mode_cancels_without_sending() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    let first = store.enqueue(letter(5, 101), at(0)).await.unwrap();
    let second = store.enqueue(letter(6, 102), at(0)).await.unwrap();

    let config = SendingConfig {
        demo_mode: true,
        ..SendingConfig::default()
    };
    let report = processor.tick(&config, at(0)).await.unwrap();

    assert_eq!(report.cancelled, 2);
    assert_eq!(transport.count(), 0);
    for id in [first, second] {
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Cancelled);
    }

    let logs = store.logs_for(SubscriberId(5)).await.unwrap();
    assert_eq!(logs[0].status, LogStatus::Cancelled);
    assert!(logs[0].detail.as_deref().unwrap().contains("Demo mode"));

    // Cancelled content does not count as delivered
    assert!(
        store
            .already_sent_content_ids(SubscriberId(5))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn pause_leaves_queue_untouched() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    let id = store.enqueue(letter(7, 101), at(0)).await.unwrap();
    let before = store.get_job(id).await.unwrap();

    let config = SendingConfig {
        pause_all_sending: true,
        ..SendingConfig::default()
    };
    let report = processor.tick(&config, at(5)).await.unwrap();
    let maintenance = processor.maintain(&config, at(5)).await.unwrap();

    assert_eq!(report, ProcessReport::default());
    assert_eq!(maintenance.released, 0);
    assert_eq!(transport.count(), 0);
    assert_eq!(store.get_job(id).await.unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn stalled_transport_times_out_as_temporary() {
    let store = Arc::new(MemoryBackingStore::new());
    let mut processor = QueueProcessor::default();
    processor.transport_timeout_secs = 1;
    processor.backoff = BackoffStrategy::Fixed { delay_secs: 60 };
    processor.init(
        store.clone(),
        Arc::new(StalledTransport::new(StdDuration::from_secs(30))),
    );

    let id = store.enqueue(letter(8, 101), at(0)).await.unwrap();
    let report = processor
        .tick(&SendingConfig::default(), at(0))
        .await
        .unwrap();

    assert_eq!(report.retried, 1);
    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.error.unwrap().contains("timed out after 1s"));
}

#[tokio::test]
async fn already_delivered_content_is_cancelled() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));

    store
        .append_log(NewEmailLog {
            job_id: None,
            subscriber_id: SubscriberId(9),
            template: "letter".to_string(),
            content_id: Some(ContentId(101)),
            status: LogStatus::Sent,
            detail: None,
            logged_at: at(0),
        })
        .await
        .unwrap();

    let duplicate = store.enqueue(letter(9, 101), at(0)).await.unwrap();
    let fresh = store.enqueue(letter(9, 102), at(0)).await.unwrap();

    let report = processor
        .tick(&SendingConfig::default(), at(0))
        .await
        .unwrap();

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(
        store.get_job(duplicate).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(store.get_job(fresh).await.unwrap().status, JobStatus::Sent);
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn maintenance_releases_and_purges() {
    let store = Arc::new(MemoryBackingStore::new());
    let processor = processor(store.clone(), Arc::new(RecordingTransport::new()));
    let config = SendingConfig::default();

    let stuck = store.enqueue(letter(1, 101), at(0)).await.unwrap();
    store.claim_due(at(0), 10).await.unwrap();

    let old = store.enqueue(letter(2, 102), at(0)).await.unwrap();
    processor.tick(&config, at(0)).await.unwrap();
    assert_eq!(store.get_job(old).await.unwrap().status, JobStatus::Sent);

    // 20 minutes on: the claim is older than the 15 minute stuck timeout
    let report = processor.maintain(&config, at(20)).await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(report.purged_jobs, 0);
    assert_eq!(store.get_job(stuck).await.unwrap().status, JobStatus::Pending);

    // 31 days on: the sent job is past the 30 day job retention
    let report = processor
        .maintain(&config, at(31 * 24 * 60))
        .await
        .unwrap();
    assert_eq!(report.purged_jobs, 1);
    assert_eq!(report.purged_logs, 0);
    assert!(store.get_job(old).await.is_err());
}

#[tokio::test]
async fn batch_is_capped_below_the_stuck_timeout() {
    let store = Arc::new(MemoryBackingStore::new());
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));
    let config = SendingConfig::default();

    for subscriber in 1..=40 {
        store.enqueue(letter(subscriber, 101), at(0)).await.unwrap();
    }

    // 15 minute stuck timeout over a 30s transport timeout leaves room for 29
    let report = processor.tick(&config, at(0)).await.unwrap();
    assert_eq!(report.claimed, 29);
    assert_eq!(report.sent, 29);

    let report = processor.tick(&config, at(1)).await.unwrap();
    assert_eq!(report.claimed, 11);
    assert_eq!(transport.count(), 40);
}

async fn released_claim_cannot_record_an_outcome(store: Arc<dyn BackingStore>) {
    let transport = RecordingTransport::new();
    let other = processor(store.clone(), Arc::new(transport.clone()));
    let config = SendingConfig::default();

    let id = store.enqueue(letter(1, 101), at(0)).await.unwrap();

    // A processor that claimed the job and then stalled past the stuck timeout
    let stale = store.claim_due(at(0), 10).await.unwrap()[0].claim();

    let maintenance = other.maintain(&config, at(16)).await.unwrap();
    assert_eq!(maintenance.released, 1);

    let report = other.tick(&config, at(16)).await.unwrap();
    assert_eq!(report.sent, 1);

    let err = store.mark_sent(stale, at(17)).await.unwrap_err();
    assert!(err.is_lost_race());
    let err = store.dead_letter(stale, "late", at(17)).await.unwrap_err();
    assert!(err.is_lost_race());

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.sent_at, Some(at(16)));
    assert_eq!(transport.count(), 1);
    assert!(store.list_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn released_claim_cannot_record_an_outcome_in_memory() {
    released_claim_cannot_record_an_outcome(Arc::new(MemoryBackingStore::new())).await;
}

#[tokio::test]
async fn released_claim_cannot_record_an_outcome_in_sqlite() {
    released_claim_cannot_record_an_outcome(Arc::new(
        SqliteBackingStore::open_in_memory().await.unwrap(),
    ))
    .await;
}

async fn expired_claims_spend_the_retry_budget(store: Arc<dyn BackingStore>) {
    let transport = RecordingTransport::new();
    let processor = processor(store.clone(), Arc::new(transport.clone()));
    let config = SendingConfig::default();

    let id = store.enqueue(letter(2, 101), at(0)).await.unwrap();

    // Every claim dies with its holder before an outcome is recorded
    for round in 0..3 {
        let start = round * 20;
        assert_eq!(store.claim_due(at(start), 10).await.unwrap().len(), 1);
        let maintenance = processor.maintain(&config, at(start + 16)).await.unwrap();
        assert_eq!(maintenance.released, 1);
    }

    let job = store.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_log.len(), 3);

    let report = processor.tick(&config, at(60)).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(transport.count(), 0);

    assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Failed);
    let letters = store.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, id);

    let logs = store.logs_for(SubscriberId(2)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);
}

#[tokio::test]
async fn expired_claims_spend_the_retry_budget_in_memory() {
    expired_claims_spend_the_retry_budget(Arc::new(MemoryBackingStore::new())).await;
}

#[tokio::test]
async fn expired_claims_spend_the_retry_budget_in_sqlite() {
    expired_claims_spend_the_retry_budget(Arc::new(
        SqliteBackingStore::open_in_memory().await.unwrap(),
    ))
    .await;
}
