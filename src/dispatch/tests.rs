use super::*;
use crate::message::headers;
use crate::storage::{
    InMemoryOutboxStore, InMemoryScheduledMessageStore, OutboxMessage, OutboxStore,
    ScheduledMessage, ScheduledMessageStore,
};
use crate::transport::{
    PublishTransport, ReceiveEndpoint, ReceiveEndpointConfig, SendTransport, TransportHost,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Recording host
// ============================================================================

#[derive(Default)]
struct Recorded {
    sent: Vec<(String, TransportMessage)>,
    published: Vec<(String, TransportMessage)>,
    failing: HashSet<String>,
}

/// Host at `mock://broker` that records every send and publish.
struct RecordingHost {
    address: Url,
    state: Arc<Mutex<Recorded>>,
}

impl RecordingHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            address: Url::parse("mock://broker").unwrap(),
            state: Arc::new(Mutex::new(Recorded::default())),
        })
    }

    fn fail(&self, address: &str) {
        self.state.lock().unwrap().failing.insert(address.to_string());
    }

    fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    fn sent(&self) -> Vec<(String, TransportMessage)> {
        self.state.lock().unwrap().sent.clone()
    }

    fn sent_to(&self, address: &str) -> Vec<TransportMessage> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == address)
            .map(|(_, m)| m)
            .collect()
    }

    fn published(&self) -> Vec<(String, TransportMessage)> {
        self.state.lock().unwrap().published.clone()
    }
}

struct RecordingSend {
    address: String,
    state: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl SendTransport for RecordingSend {
    async fn send(
        &self,
        message: &TransportMessage,
        _cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&self.address) {
            return Err(TransportError::TransportFailure("broker unavailable".into()));
        }
        state.sent.push((self.address.clone(), message.clone()));
        Ok(())
    }
}

struct RecordingPublish {
    message_type: String,
    state: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl PublishTransport for RecordingPublish {
    async fn publish(
        &self,
        message: &TransportMessage,
        _cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((self.message_type.clone(), message.clone()));
        Ok(())
    }
}

#[async_trait]
impl TransportHost for RecordingHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, _cancel: &CancellationToken) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    async fn stop(&self) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    async fn get_send_transport(
        &self,
        address: &Url,
    ) -> std::result::Result<Arc<dyn SendTransport>, TransportError> {
        Ok(Arc::new(RecordingSend {
            address: address.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn get_publish_transport(
        &self,
        message_type: &str,
    ) -> std::result::Result<Arc<dyn PublishTransport>, TransportError> {
        Ok(Arc::new(RecordingPublish {
            message_type: message_type.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn connect_receive_endpoint(
        &self,
        _config: ReceiveEndpointConfig,
    ) -> std::result::Result<Arc<dyn ReceiveEndpoint>, TransportError> {
        Err(TransportError::Configuration("not supported".into()))
    }
}

fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

fn delivery(host: &Arc<RecordingHost>) -> Delivery {
    let provider = TransportHostProvider::from_hosts([host.clone() as Arc<dyn TransportHost>]);
    Delivery::new(Arc::new(provider)).with_publish_address(url("mock://broker"))
}

fn message(body: &'static str) -> TransportMessage {
    TransportMessage::builder(Bytes::from_static(body.as_bytes()))
        .message_type("OrderPlaced")
        .message_id(Uuid::now_v7())
        .build()
}

fn outbox_row(body: &'static str, destination: Option<&str>) -> OutboxMessage {
    OutboxMessage::from_transport(&message(body), Some(url("mock://broker")), destination.map(url))
}

// ============================================================================
// Outbox dispatcher
// ============================================================================

async fn outbox_fixture(
    options: OutboxDispatchOptions,
) -> (Arc<RecordingHost>, Arc<InMemoryOutboxStore>, OutboxDispatcher) {
    let host = RecordingHost::new();
    let store = Arc::new(InMemoryOutboxStore::new());
    let dispatcher = OutboxDispatcher::new(store.clone(), delivery(&host), options);
    (host, store, dispatcher)
}

#[tokio::test]
async fn test_outbox_dispatches_only_unsent_rows() {
    let (host, store, dispatcher) = outbox_fixture(OutboxDispatchOptions::default()).await;
    let m1 = outbox_row("m1", Some("mock://broker/orders"));
    let mut m2 = outbox_row("m2", Some("mock://broker/billing"));
    m2.sent_time = Some(Utc::now());
    store.add(&m1).await.unwrap();
    store.add(&m2).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dispatched, 1);
    let sent = host.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.message_id(), Some(m1.message_id));
    assert!(store.get_pending(10).await.unwrap().is_empty());

    let again = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(again, DispatchReport::default());
}

#[tokio::test]
async fn test_outbox_one_row_per_destination_per_cycle_in_order() {
    let (host, store, dispatcher) = outbox_fixture(OutboxDispatchOptions::default()).await;
    let first = outbox_row("first", Some("mock://broker/orders"));
    let second = outbox_row("second", Some("mock://broker/orders/"));
    let other = outbox_row("other", Some("mock://broker/billing"));
    for (offset, row) in [&first, &second, &other].into_iter().enumerate() {
        let mut row = row.clone();
        row.enqueued_time = Utc::now() + ChronoDuration::milliseconds(offset as i64);
        store.add(&row).await.unwrap();
    }

    let cycle = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(cycle.dispatched, 2);
    assert_eq!(cycle.deferred, 1);

    let cycle = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(cycle.dispatched, 1);

    let bodies: Vec<Bytes> = host
        .sent()
        .into_iter()
        .filter(|(to, _)| to.starts_with("mock://broker/orders"))
        .map(|(_, m)| m.body().clone())
        .collect();
    assert_eq!(bodies, [Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
}

#[tokio::test]
async fn test_outbox_failure_leaves_row_pending() {
    let (host, store, dispatcher) = outbox_fixture(OutboxDispatchOptions::default()).await;
    let row = outbox_row("retry-me", Some("mock://broker/orders"));
    store.add(&row).await.unwrap();
    host.fail("mock://broker/orders");

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(store.get_pending(10).await.unwrap().len(), 1);

    host.heal();
    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert!(store.get_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_outbox_publish_row_goes_out_by_message_type() {
    let (host, store, dispatcher) = outbox_fixture(OutboxDispatchOptions::default()).await;
    store.add(&outbox_row("event", None)).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dispatched, 1);
    let published = host.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "OrderPlaced");
    assert!(host.sent().is_empty());
}

#[tokio::test]
async fn test_outbox_unroutable_row_dead_lettered_and_marked() {
    let options = OutboxDispatchOptions {
        dead_letter_address: Some(url("mock://broker/outbox-dlq")),
        ..Default::default()
    };
    let (host, store, dispatcher) = outbox_fixture(options).await;
    let row = outbox_row("lost", Some("nowhere://elsewhere/orders"));
    store.add(&row).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert!(store.get_pending(10).await.unwrap().is_empty());
    let dead = host.sent_to("mock://broker/outbox-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].headers().get(headers::DEAD_LETTER_REASON),
        Some("UnresolvableDestination")
    );
    assert!(dead[0].headers().contains_key(headers::DEAD_LETTER_TIME));
}

#[tokio::test]
async fn test_outbox_unroutable_row_without_dead_letter_stays_pending() {
    let (_host, store, dispatcher) = outbox_fixture(OutboxDispatchOptions::default()).await;
    store
        .add(&outbox_row("lost", Some("nowhere://elsewhere/orders")))
        .await
        .unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(store.get_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_outbox_respects_batch_size() {
    let options = OutboxDispatchOptions {
        batch_size: 2,
        ..Default::default()
    };
    let (host, store, dispatcher) = outbox_fixture(options).await;
    for (i, queue) in ["a", "b", "c"].iter().enumerate() {
        let mut row = outbox_row("x", Some(&format!("mock://broker/{queue}")));
        row.enqueued_time = Utc::now() + ChronoDuration::milliseconds(i as i64);
        store.add(&row).await.unwrap();
    }

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(host.sent().len(), 2);
    assert_eq!(store.get_pending(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_outbox_loop_drains_and_stops() {
    let options = OutboxDispatchOptions {
        poll_interval_ms: 10,
        ..Default::default()
    };
    let (host, store, dispatcher) = outbox_fixture(options).await;
    store
        .add(&outbox_row("looped", Some("mock://broker/orders")))
        .await
        .unwrap();

    let handle = Arc::new(dispatcher).spawn(CancellationToken::new());
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while host.sent().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbox loop should deliver the row");

    assert_eq!(handle.name(), "outbox");
    handle.stop().await;
    assert!(store.get_pending(10).await.unwrap().is_empty());
}

// ============================================================================
// Scheduled dispatcher
// ============================================================================

fn scheduled(
    body: &'static str,
    destination: Option<&str>,
    at: chrono::DateTime<Utc>,
) -> ScheduledMessage {
    let destination = destination.map(url);
    ScheduledMessage::from_transport(Uuid::now_v7(), &message(body), "OrderPlaced", destination.as_ref(), at)
}

#[tokio::test]
async fn test_scheduled_dispatches_due_send_without_routing_header() {
    let host = RecordingHost::new();
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let dispatcher =
        ScheduledMessageDispatcher::new(store.clone(), delivery(&host), ScheduledDispatchOptions::default());

    let due = scheduled("due", Some("mock://broker/orders"), Utc::now() - ChronoDuration::seconds(1));
    let later = scheduled("later", Some("mock://broker/orders"), Utc::now() + ChronoDuration::hours(1));
    store.add(&due).await.unwrap();
    store.add(&later).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dispatched, 1);
    let sent = host.sent_to("mock://broker/orders");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body(), &Bytes::from_static(b"due"));
    assert_eq!(sent[0].message_type(), Some("OrderPlaced"));
    assert!(!sent[0].headers().contains_key(headers::DESTINATION_ADDRESS));
    assert!(store.get(due.token_id).await.unwrap().unwrap().is_dispatched());
    assert!(!store.get(later.token_id).await.unwrap().unwrap().is_dispatched());
}

#[tokio::test]
async fn test_scheduled_publish_routes_by_message_type() {
    let host = RecordingHost::new();
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let dispatcher =
        ScheduledMessageDispatcher::new(store.clone(), delivery(&host), ScheduledDispatchOptions::default());
    store
        .add(&scheduled("event", None, Utc::now() - ChronoDuration::seconds(1)))
        .await
        .unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dispatched, 1);
    assert_eq!(host.published()[0].0, "OrderPlaced");
}

#[tokio::test]
async fn test_scheduled_failure_stays_due() {
    let host = RecordingHost::new();
    host.fail("mock://broker/orders");
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let dispatcher =
        ScheduledMessageDispatcher::new(store.clone(), delivery(&host), ScheduledDispatchOptions::default());
    let row = scheduled("due", Some("mock://broker/orders"), Utc::now() - ChronoDuration::seconds(1));
    store.add(&row).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(store.get_due(Utc::now(), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduled_invalid_destination_dead_lettered() {
    let host = RecordingHost::new();
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let options = ScheduledDispatchOptions {
        dead_letter_address: Some(url("mock://broker/scheduler-dlq")),
        ..Default::default()
    };
    let dispatcher = ScheduledMessageDispatcher::new(store.clone(), delivery(&host), options);
    let mut row = scheduled("broken", None, Utc::now() - ChronoDuration::seconds(1));
    row.headers.insert(headers::DESTINATION_ADDRESS, "not a url");
    store.add(&row).await.unwrap();

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    let dead = host.sent_to("mock://broker/scheduler-dlq");
    assert_eq!(
        dead[0].headers().get(headers::DEAD_LETTER_REASON),
        Some("InvalidDestinationAddress")
    );
    assert!(store.get_due(Utc::now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduled_cancelled_token_not_dispatched() {
    let host = RecordingHost::new();
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let dispatcher =
        ScheduledMessageDispatcher::new(store.clone(), delivery(&host), ScheduledDispatchOptions::default());
    let row = scheduled("cancelled", Some("mock://broker/orders"), Utc::now() - ChronoDuration::seconds(1));
    store.add(&row).await.unwrap();
    assert!(store.cancel(row.token_id).await.unwrap());

    let report = dispatcher.dispatch_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.total(), 0);
    assert!(host.sent().is_empty());
}

// ============================================================================
// Schedulers
// ============================================================================

#[tokio::test]
async fn test_persisted_scheduler_rejects_past_time() {
    let scheduler = PersistedMessageScheduler::new(Arc::new(InMemoryScheduledMessageStore::new()));

    let result = scheduler
        .schedule_publish(message("late"), Utc::now() - ChronoDuration::seconds(1))
        .await;

    assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_persisted_scheduler_rejects_zero_delay_and_untyped_message() {
    let scheduler = PersistedMessageScheduler::new(Arc::new(InMemoryScheduledMessageStore::new()));

    let zero = scheduler
        .schedule_publish_after(message("now"), std::time::Duration::ZERO)
        .await;
    assert!(matches!(zero, Err(DispatchError::InvalidArgument(_))));

    let untyped = TransportMessage::builder(Bytes::from_static(b"{}")).build();
    let result = scheduler
        .schedule_publish(untyped, Utc::now() + ChronoDuration::minutes(1))
        .await;
    assert!(matches!(result, Err(DispatchError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_persisted_send_records_destination_and_cancels_once() {
    let store = Arc::new(InMemoryScheduledMessageStore::new());
    let scheduler = PersistedMessageScheduler::new(store.clone());
    let at = Utc::now() + ChronoDuration::minutes(5);

    let handle = scheduler
        .schedule_send(&url("mock://broker/orders"), message("later"), at)
        .await
        .unwrap();

    assert_eq!(handle.scheduled_time(), at);
    let stored = store.get(handle.token_id()).await.unwrap().unwrap();
    assert_eq!(stored.destination(), Some(url("mock://broker/orders")));
    assert_eq!(stored.message_type, "OrderPlaced");

    assert!(handle.cancel().await.unwrap());
    assert!(!handle.cancel().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_in_memory_scheduler_delivers_after_delay() {
    let host = RecordingHost::new();
    let scheduler = InMemoryMessageScheduler::new(delivery(&host));

    scheduler
        .schedule_send_after(
            &url("mock://broker/orders"),
            message("timer"),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(scheduler.pending(), 1);

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    assert!(host.sent().is_empty());

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    assert_eq!(host.sent_to("mock://broker/orders").len(), 1);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_memory_scheduler_cancel_prevents_delivery() {
    let host = RecordingHost::new();
    let scheduler = InMemoryMessageScheduler::new(delivery(&host));

    let handle = scheduler
        .schedule_publish_after(message("never"), std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert!(handle.cancel().await.unwrap());

    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    assert!(host.published().is_empty());
    assert!(!handle.cancel().await.unwrap());
}

#[tokio::test]
async fn test_delivery_rejects_cancelled_token_before_work() {
    let host = RecordingHost::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = delivery(&host)
        .send(&url("mock://broker/orders"), &message("x"), &cancel)
        .await;

    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(host.sent().is_empty());
}
