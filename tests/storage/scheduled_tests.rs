//! ScheduledMessageStore contract tests.

use bytes::Bytes;
use chrono::{DateTime, Duration, DurationRound, Utc};
use courier::message::Headers;
use courier::storage::{ScheduledMessage, ScheduledMessageStore, StorageError};
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    Utc::now().duration_trunc(Duration::microseconds(1)).unwrap()
}

fn scheduled(at: DateTime<Utc>) -> ScheduledMessage {
    let mut headers = Headers::new();
    headers.insert("DestinationAddress", "channel://local/reminders");
    ScheduledMessage {
        token_id: Uuid::now_v7(),
        message_type: "ReminderDue".to_string(),
        content_type: Some("application/json".to_string()),
        body: Bytes::from_static(b"{}"),
        headers,
        scheduled_time: at,
        created_time: now(),
        dispatched_time: None,
    }
}

pub async fn test_add_and_get<S: ScheduledMessageStore + ?Sized>(store: &S) {
    let message = scheduled(now() + Duration::hours(1));
    store.add(&message).await.unwrap();

    let stored = store.get(message.token_id).await.unwrap().expect("row should exist");
    assert_eq!(stored, message);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());

    store.cancel(message.token_id).await.unwrap();
}

pub async fn test_due_excludes_future_and_dispatched<S: ScheduledMessageStore + ?Sized>(store: &S) {
    let now = now();
    let due = scheduled(now - Duration::seconds(1));
    let future = scheduled(now + Duration::seconds(60));
    let done = scheduled(now - Duration::seconds(2));
    for m in [&due, &future, &done] {
        store.add(m).await.unwrap();
    }
    store.mark_dispatched(done.token_id, now).await.unwrap();

    let result = store.get_due(now, 1_000).await.unwrap();
    let tokens: Vec<Uuid> = result.iter().map(|m| m.token_id).collect();
    assert!(tokens.contains(&due.token_id));
    assert!(!tokens.contains(&future.token_id));
    assert!(!tokens.contains(&done.token_id));

    store.mark_dispatched(due.token_id, now).await.unwrap();
    store.cancel(future.token_id).await.unwrap();
}

pub async fn test_due_ordered_by_schedule<S: ScheduledMessageStore + ?Sized>(store: &S) {
    let now = now();
    let later = scheduled(now - Duration::seconds(10));
    let earlier = scheduled(now - Duration::seconds(20));
    store.add(&later).await.unwrap();
    store.add(&earlier).await.unwrap();

    let tokens: Vec<Uuid> = store
        .get_due(now, 2)
        .await
        .unwrap()
        .iter()
        .map(|m| m.token_id)
        .collect();
    assert_eq!(tokens, vec![earlier.token_id, later.token_id]);

    store.mark_dispatched(earlier.token_id, now).await.unwrap();
    store.mark_dispatched(later.token_id, now).await.unwrap();
}

pub async fn test_cancel_is_permanent<S: ScheduledMessageStore + ?Sized>(store: &S) {
    let now = now();
    let pending = scheduled(now - Duration::seconds(1));
    let dispatched = scheduled(now - Duration::seconds(1));
    store.add(&pending).await.unwrap();
    store.add(&dispatched).await.unwrap();
    store.mark_dispatched(dispatched.token_id, now).await.unwrap();

    assert!(store.cancel(pending.token_id).await.unwrap());
    assert!(!store.cancel(pending.token_id).await.unwrap());
    assert!(!store.cancel(dispatched.token_id).await.unwrap());
    assert!(!store.cancel(Uuid::new_v4()).await.unwrap());

    let due = store.get_due(now + Duration::days(1), 1_000).await.unwrap();
    assert!(due.iter().all(|m| m.token_id != pending.token_id));
}

pub async fn test_readd_of_dispatched_token_rejected<S: ScheduledMessageStore + ?Sized>(store: &S) {
    let now = now();
    let message = scheduled(now - Duration::seconds(30));
    store.add(&message).await.unwrap();
    store.mark_dispatched(message.token_id, now).await.unwrap();

    let readded = store.add(&message).await;
    assert!(matches!(readded, Err(StorageError::DuplicateKey(_))));

    let stored = store.get(message.token_id).await.unwrap().unwrap();
    assert_eq!(stored.dispatched_time, Some(now));
    let due = store.get_due(now + Duration::days(1), 1_000).await.unwrap();
    assert!(due.iter().all(|m| m.token_id != message.token_id));
}

#[macro_export]
macro_rules! run_scheduled_store_tests {
    ($store:expr) => {
        use $crate::storage::scheduled_tests::*;

        test_add_and_get($store).await;
        println!("  test_add_and_get: PASSED");

        test_due_excludes_future_and_dispatched($store).await;
        println!("  test_due_excludes_future_and_dispatched: PASSED");

        test_due_ordered_by_schedule($store).await;
        println!("  test_due_ordered_by_schedule: PASSED");

        test_cancel_is_permanent($store).await;
        println!("  test_cancel_is_permanent: PASSED");

        test_readd_of_dispatched_token_rejected($store).await;
        println!("  test_readd_of_dispatched_token_rejected: PASSED");
    };
}
