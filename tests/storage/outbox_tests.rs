//! OutboxStore contract tests.

use bytes::Bytes;
use chrono::{Duration, DurationRound, Utc};
use courier::message::Headers;
use courier::storage::{OutboxMessage, OutboxStore, StorageError};
use url::Url;
use uuid::Uuid;

fn row(offset_secs: i64) -> OutboxMessage {
    let now = Utc::now()
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    let mut headers = Headers::new();
    headers.insert("Tenant", "acme");
    OutboxMessage {
        message_id: Uuid::now_v7(),
        correlation_id: Some(Uuid::new_v4()),
        conversation_id: None,
        source_address: Some(Url::parse("channel://local/orders").unwrap()),
        destination_address: Some(Url::parse("amqp://broker/billing").unwrap()),
        message_type: Some("OrderPlaced".to_string()),
        content_type: Some("application/json".to_string()),
        body: Bytes::from_static(b"{\"total\":10}"),
        headers,
        enqueued_time: now + Duration::seconds(offset_secs),
        sent_time: None,
    }
}

// =============================================================================
// OutboxStore::add / get_pending
// =============================================================================

pub async fn test_add_round_trips_all_columns<S: OutboxStore + ?Sized>(store: &S) {
    let message = row(-1_000);
    store.add(&message).await.expect("add should succeed");

    let pending = store.get_pending(1_000).await.expect("get_pending should succeed");
    let stored = pending
        .into_iter()
        .find(|m| m.message_id == message.message_id)
        .expect("row should be pending");
    assert_eq!(stored, message);

    store.mark_sent(message.message_id, Utc::now()).await.unwrap();
}

pub async fn test_pending_excludes_sent<S: OutboxStore + ?Sized>(store: &S) {
    let m1 = row(-900);
    let mut m2 = row(-901);
    m2.sent_time = Some(Utc::now());
    store.add(&m1).await.unwrap();
    store.add(&m2).await.unwrap();

    let pending = store.get_pending(1_000).await.unwrap();
    assert!(pending.iter().any(|m| m.message_id == m1.message_id));
    assert!(pending.iter().all(|m| m.message_id != m2.message_id));

    store.mark_sent(m1.message_id, Utc::now()).await.unwrap();
}

pub async fn test_pending_ordered_and_capped<S: OutboxStore + ?Sized>(store: &S) {
    let newest = row(-10);
    let oldest = row(-30);
    let middle = row(-20);
    for m in [&newest, &oldest, &middle] {
        store.add(m).await.unwrap();
    }

    let pending = store.get_pending(2).await.unwrap();
    let ids: Vec<Uuid> = pending.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![oldest.message_id, middle.message_id]);
    assert!(store.get_pending(0).await.unwrap().is_empty());

    for m in [&newest, &oldest, &middle] {
        store.mark_sent(m.message_id, Utc::now()).await.unwrap();
    }
}

// =============================================================================
// OutboxStore::mark_sent
// =============================================================================

pub async fn test_mark_sent_is_one_way<S: OutboxStore + ?Sized>(store: &S) {
    let message = row(-5);
    store.add(&message).await.unwrap();

    store.mark_sent(message.message_id, Utc::now()).await.unwrap();
    store.mark_sent(message.message_id, Utc::now()).await.unwrap();
    store.mark_sent(Uuid::new_v4(), Utc::now()).await.unwrap();

    let pending = store.get_pending(1_000).await.unwrap();
    assert!(pending.iter().all(|m| m.message_id != message.message_id));
}

pub async fn test_readd_of_sent_row_rejected<S: OutboxStore + ?Sized>(store: &S) {
    let message = row(-2_000);
    store.add(&message).await.unwrap();
    store.mark_sent(message.message_id, Utc::now()).await.unwrap();

    let readded = store.add(&message).await;
    assert!(matches!(readded, Err(StorageError::DuplicateKey(_))));

    let pending = store.get_pending(1_000).await.unwrap();
    assert!(pending.iter().all(|m| m.message_id != message.message_id));
}

#[macro_export]
macro_rules! run_outbox_store_tests {
    ($store:expr) => {
        use $crate::storage::outbox_tests::*;

        test_add_round_trips_all_columns($store).await;
        println!("  test_add_round_trips_all_columns: PASSED");

        test_pending_excludes_sent($store).await;
        println!("  test_pending_excludes_sent: PASSED");

        test_pending_ordered_and_capped($store).await;
        println!("  test_pending_ordered_and_capped: PASSED");

        test_mark_sent_is_one_way($store).await;
        println!("  test_mark_sent_is_one_way: PASSED");

        test_readd_of_sent_row_rejected($store).await;
        println!("  test_readd_of_sent_row_rejected: PASSED");
    };
}
