//! SagaRepository contract tests.

use courier::storage::{SagaRepository, SagaState};
use serde_json::json;
use uuid::Uuid;

pub async fn test_get_missing<S: SagaRepository + ?Sized>(store: &S) {
    assert!(store.get(Uuid::new_v4(), "OrderSaga").await.unwrap().is_none());
}

pub async fn test_new_state_version_one<S: SagaRepository + ?Sized>(store: &S) {
    let mut state = SagaState::new(Uuid::new_v4(), "OrderSaga", json!({"step": "placed"}));
    state.conversation_id = Some(Uuid::new_v4());

    assert!(store.save(&mut state).await.unwrap());
    assert_eq!(state.version, 1);

    let stored = store.get(state.correlation_id, "OrderSaga").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.data, json!({"step": "placed"}));
    assert_eq!(stored.conversation_id, state.conversation_id);
}

pub async fn test_current_version_increments_by_one<S: SagaRepository + ?Sized>(store: &S) {
    let mut state = SagaState::new(Uuid::new_v4(), "OrderSaga", json!({"step": 1}));
    store.save(&mut state).await.unwrap();

    state.data = json!({"step": 2});
    assert!(store.save(&mut state).await.unwrap());
    assert_eq!(state.version, 2);

    let stored = store.get(state.correlation_id, "OrderSaga").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.data, json!({"step": 2}));
}

pub async fn test_stale_version_rejected<S: SagaRepository + ?Sized>(store: &S) {
    let id = Uuid::new_v4();
    let mut reader_a = SagaState::new(id, "OrderSaga", json!({"step": 1}));
    store.save(&mut reader_a).await.unwrap();
    let mut reader_b = store.get(id, "OrderSaga").await.unwrap().unwrap();

    reader_a.data = json!({"step": "a"});
    assert!(store.save(&mut reader_a).await.unwrap());

    reader_b.data = json!({"step": "b"});
    assert!(!store.save(&mut reader_b).await.unwrap());
    assert_eq!(reader_b.version, 1);

    let stored = store.get(id, "OrderSaga").await.unwrap().unwrap();
    assert_eq!(stored.data, json!({"step": "a"}));
    assert_eq!(stored.version, 2);
}

pub async fn test_delete<S: SagaRepository + ?Sized>(store: &S) {
    let mut state = SagaState::new(Uuid::new_v4(), "OrderSaga", json!(null));
    store.save(&mut state).await.unwrap();

    store.delete(state.correlation_id, "OrderSaga").await.unwrap();
    store.delete(state.correlation_id, "OrderSaga").await.unwrap();
    assert!(store.get(state.correlation_id, "OrderSaga").await.unwrap().is_none());
}

pub async fn test_handled_messages_round_trip<S: SagaRepository + ?Sized>(store: &S) {
    let mut state = SagaState::new(Uuid::new_v4(), "OrderSaga", json!({"step": 1}));
    let handled = Uuid::now_v7();
    state.record_handled(handled);
    store.save(&mut state).await.unwrap();

    let stored = store.get(state.correlation_id, "OrderSaga").await.unwrap().unwrap();
    assert_eq!(stored.handled_messages, vec![handled]);
}

pub async fn test_delete_if_version_checks_version<S: SagaRepository + ?Sized>(store: &S) {
    let mut state = SagaState::new(Uuid::new_v4(), "OrderSaga", json!({"step": 1}));
    store.save(&mut state).await.unwrap();
    let stale = state.version;
    state.data = json!({"step": 2});
    store.save(&mut state).await.unwrap();

    assert!(!store
        .delete_if_version(state.correlation_id, "OrderSaga", stale)
        .await
        .unwrap());
    assert!(store.get(state.correlation_id, "OrderSaga").await.unwrap().is_some());

    assert!(store
        .delete_if_version(state.correlation_id, "OrderSaga", state.version)
        .await
        .unwrap());
    assert!(store.get(state.correlation_id, "OrderSaga").await.unwrap().is_none());
    assert!(!store
        .delete_if_version(state.correlation_id, "OrderSaga", state.version)
        .await
        .unwrap());
}

#[macro_export]
macro_rules! run_saga_repository_tests {
    ($store:expr) => {
        use $crate::storage::saga_tests::*;

        test_get_missing($store).await;
        println!("  test_get_missing: PASSED");

        test_new_state_version_one($store).await;
        println!("  test_new_state_version_one: PASSED");

        test_current_version_increments_by_one($store).await;
        println!("  test_current_version_increments_by_one: PASSED");

        test_stale_version_rejected($store).await;
        println!("  test_stale_version_rejected: PASSED");

        test_delete($store).await;
        println!("  test_delete: PASSED");

        test_handled_messages_round_trip($store).await;
        println!("  test_handled_messages_round_trip: PASSED");

        test_delete_if_version_checks_version($store).await;
        println!("  test_delete_if_version_checks_version: PASSED");
    };
}
