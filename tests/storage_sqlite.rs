//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Each test opens a fresh database file in a temporary directory, so no
//! external setup is required.

mod storage;

use courier::storage::sqlite::{
    self, SqliteInboxStore, SqliteOutboxStore, SqliteSagaRepository, SqliteScheduledMessageStore,
};
use courier::storage::{InboxState, InboxStore, OutboxMessage, OutboxStore, StorageError};
use courier::TransportMessage;
use tempfile::TempDir;
use uuid::Uuid;

async fn connect() -> (TempDir, sqlx::SqlitePool) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("nested").join("courier.db");
    let pool = sqlite::connect(path.to_str().expect("utf-8 path"))
        .await
        .expect("Failed to open SQLite database");
    (dir, pool)
}

#[tokio::test]
async fn test_sqlite_outbox_store() {
    println!("=== SQLite OutboxStore Tests ===");
    let (_dir, pool) = connect().await;
    let store = SqliteOutboxStore::new(pool);

    run_outbox_store_tests!(&store);

    println!("=== All SQLite OutboxStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_inbox_store() {
    println!("=== SQLite InboxStore Tests ===");
    let (_dir, pool) = connect().await;
    let store = SqliteInboxStore::new(pool);

    run_inbox_store_tests!(&store);

    println!("=== All SQLite InboxStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_scheduled_store() {
    println!("=== SQLite ScheduledMessageStore Tests ===");
    let (_dir, pool) = connect().await;
    let store = SqliteScheduledMessageStore::new(pool);

    run_scheduled_store_tests!(&store);

    println!("=== All SQLite ScheduledMessageStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_saga_repository() {
    println!("=== SQLite SagaRepository Tests ===");
    let (_dir, pool) = connect().await;
    let store = SqliteSagaRepository::new(pool);

    run_saga_repository_tests!(&store);

    println!("=== All SQLite SagaRepository tests PASSED ===");
}

#[tokio::test]
async fn test_memory_stores_share_contract() {
    let stores = courier::storage::Stores::in_memory();

    {
        run_outbox_store_tests!(stores.outbox.as_ref());
    }
    {
        run_inbox_store_tests!(stores.inbox.as_ref());
    }
    {
        run_scheduled_store_tests!(stores.scheduled.as_ref());
    }
    {
        run_saga_repository_tests!(stores.sagas.as_ref());
    }
}

#[tokio::test]
async fn test_sqlite_session_commit_and_rollback() {
    let (_dir, pool) = connect().await;
    let stores = sqlite::stores(pool);
    let committed_id = Uuid::new_v4();
    let rolled_back_id = Uuid::new_v4();

    let mut session = stores.sessions.begin().await.unwrap();
    assert!(session
        .try_add_inbox(&InboxState::new(committed_id, "billing"))
        .await
        .unwrap());
    let row = OutboxMessage::from_transport(&TransportMessage::builder(b"{}".to_vec()).build(), None, None);
    session.add_outbox(&row).await.unwrap();
    session.commit().await.unwrap();

    let mut session = stores.sessions.begin().await.unwrap();
    session
        .try_add_inbox(&InboxState::new(rolled_back_id, "billing"))
        .await
        .unwrap();
    session.rollback().await.unwrap();

    assert!(stores.inbox.get(committed_id, "billing").await.unwrap().is_some());
    assert!(stores.inbox.get(rolled_back_id, "billing").await.unwrap().is_none());
    let pending = stores.outbox.get_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, row.message_id);
}

#[tokio::test]
async fn test_sqlite_session_sees_stored_duplicates() {
    let (_dir, pool) = connect().await;
    let stores = sqlite::stores(pool);
    let id = Uuid::new_v4();
    stores.inbox.try_add(&InboxState::new(id, "billing")).await.unwrap();

    let mut session = stores.sessions.begin().await.unwrap();
    assert!(!session
        .try_add_inbox(&InboxState::new(id, "billing"))
        .await
        .unwrap());
    session.rollback().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_saga_nil_correlation_rejected() {
    use courier::storage::{SagaRepository, SagaState};

    let (_dir, pool) = connect().await;
    let repo = SqliteSagaRepository::new(pool);
    let mut state = SagaState::new(Uuid::nil(), "OrderSaga", serde_json::json!({}));

    assert!(matches!(
        repo.save(&mut state).await,
        Err(StorageError::InvalidRecord(_))
    ));
}
