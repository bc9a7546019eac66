//! InboxStore contract tests.

use chrono::{Duration, DurationRound, Utc};
use courier::storage::{InboxState, InboxStore};
use uuid::Uuid;

fn state(message_id: Uuid, consumer: &str) -> InboxState {
    let mut state = InboxState::new(message_id, consumer);
    state.received_time = state
        .received_time
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    state
}

pub async fn test_first_try_add_succeeds<S: InboxStore + ?Sized>(store: &S) {
    let id = Uuid::new_v4();
    assert!(store.try_add(&state(id, "billing")).await.unwrap());

    let stored = store.get(id, "billing").await.unwrap().expect("row should exist");
    assert!(stored.processed_time.is_none());
}

pub async fn test_duplicate_try_add_leaves_original<S: InboxStore + ?Sized>(store: &S) {
    let id = Uuid::new_v4();
    let first = state(id, "billing");
    assert!(store.try_add(&first).await.unwrap());

    let mut second = state(id, "billing");
    second.received_time = first.received_time + Duration::minutes(5);
    assert!(!store.try_add(&second).await.unwrap());

    let stored = store.get(id, "billing").await.unwrap().unwrap();
    assert_eq!(stored.received_time, first.received_time);
}

pub async fn test_same_message_other_consumer<S: InboxStore + ?Sized>(store: &S) {
    let id = Uuid::new_v4();
    assert!(store.try_add(&state(id, "billing")).await.unwrap());
    assert!(store.try_add(&state(id, "shipping")).await.unwrap());
}

pub async fn test_mark_processed<S: InboxStore + ?Sized>(store: &S) {
    let id = Uuid::new_v4();
    store.try_add(&state(id, "billing")).await.unwrap();
    let at = Utc::now().duration_trunc(Duration::microseconds(1)).unwrap();

    store.mark_processed(id, "billing", at).await.unwrap();
    store.mark_processed(id, "missing", at).await.unwrap();

    assert_eq!(store.get(id, "billing").await.unwrap().unwrap().processed_time, Some(at));
    assert!(store.get(id, "missing").await.unwrap().is_none());
}

#[macro_export]
macro_rules! run_inbox_store_tests {
    ($store:expr) => {
        use $crate::storage::inbox_tests::*;

        test_first_try_add_succeeds($store).await;
        println!("  test_first_try_add_succeeds: PASSED");

        test_duplicate_try_add_leaves_original($store).await;
        println!("  test_duplicate_try_add_leaves_original: PASSED");

        test_same_message_other_consumer($store).await;
        println!("  test_same_message_other_consumer: PASSED");

        test_mark_processed($store).await;
        println!("  test_mark_processed: PASSED");
    };
}
