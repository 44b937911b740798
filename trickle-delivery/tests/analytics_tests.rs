#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use trickle_common::{
    ContentId, EventType, Frequency, JobId, Preferences, SubscriberId, SubscriberStatus,
};
use trickle_delivery::{AnalyticsRecorder, NewEvent, Recorded};
use trickle_store::{
    BackingStore, MemoryBackingStore, MirrorStore, SqliteBackingStore, SubscriberMirror,
};

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn duplicate_open_is_stored_once(store: Arc<dyn BackingStore>) {
    let recorder = AnalyticsRecorder::new(store);
    let open = NewEvent::new(EventType::Opened, ContentId(12), SubscriberId(9)).for_job(JobId(55));

    assert_eq!(
        recorder.record(open.clone(), now()).await.unwrap(),
        Recorded::Inserted
    );
    assert_eq!(
        recorder.record(open, now()).await.unwrap(),
        Recorded::Duplicate
    );
    assert_eq!(
        recorder.count(ContentId(12), EventType::Opened).await.unwrap(),
        1
    );

    // Distinct click targets are distinct events
    let click = NewEvent::new(EventType::Clicked, ContentId(12), SubscriberId(9)).for_job(JobId(55));
    recorder
        .record(click.clone().with_target("https://example.com/a"), now())
        .await
        .unwrap();
    recorder
        .record(click.with_target("https://example.com/b"), now())
        .await
        .unwrap();
    assert_eq!(
        recorder.count(ContentId(12), EventType::Clicked).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn duplicate_open_is_stored_once_in_memory() {
    duplicate_open_is_stored_once(Arc::new(MemoryBackingStore::new())).await;
}

#[tokio::test]
async fn duplicate_open_is_stored_once_in_sqlite() {
    duplicate_open_is_stored_once(Arc::new(SqliteBackingStore::open_in_memory().await.unwrap()))
        .await;
}

async fn queue_and_newsletter_ids_do_not_collide(store: Arc<dyn BackingStore>) {
    let recorder = AnalyticsRecorder::new(store);

    // Queue job 55 for newsletter 3, then a direct open of newsletter 55
    let queued = NewEvent::new(EventType::Opened, ContentId(3), SubscriberId(9)).for_job(JobId(55));
    let direct = NewEvent::new(EventType::Opened, ContentId(55), SubscriberId(9));

    assert_eq!(
        recorder.record(queued, now()).await.unwrap(),
        Recorded::Inserted
    );
    assert_eq!(
        recorder.record(direct, now()).await.unwrap(),
        Recorded::Inserted
    );
    assert_eq!(
        recorder.count(ContentId(55), EventType::Opened).await.unwrap(),
        1
    );
    assert_eq!(
        recorder.count(ContentId(3), EventType::Opened).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn queue_and_newsletter_ids_do_not_collide_in_memory() {
    queue_and_newsletter_ids_do_not_collide(Arc::new(MemoryBackingStore::new())).await;
}

#[tokio::test]
async fn queue_and_newsletter_ids_do_not_collide_in_sqlite() {
    queue_and_newsletter_ids_do_not_collide(Arc::new(
        SqliteBackingStore::open_in_memory().await.unwrap(),
    ))
    .await;
}

#[tokio::test]
async fn unsubscribe_takes_subscriber_out_of_rotation() {
    let store = Arc::new(MemoryBackingStore::new());
    store
        .upsert_mirror(SubscriberMirror {
            id: SubscriberId(9),
            email: "reader@example.com".to_string(),
            status: SubscriberStatus::Active,
            frequency: Frequency::Weekly,
            preferences: Preferences::all(),
            next_send_at: Some(now()),
            emails_sent: 3,
            last_sent_at: None,
            source_updated_at: now(),
        })
        .await
        .unwrap();

    let recorder = AnalyticsRecorder::new(store.clone());
    recorder
        .record(
            NewEvent::new(EventType::Unsubscribed, ContentId(12), SubscriberId(9)),
            now(),
        )
        .await
        .unwrap();

    let row = store.get_mirror(SubscriberId(9)).await.unwrap().unwrap();
    assert_eq!(row.status, SubscriberStatus::Unsubscribed);
    assert_eq!(row.next_send_at, None);
    assert!(store.due_subscribers(now(), 10).await.unwrap().is_empty());
}
