use super::*;
use crate::storage::{
    InMemoryInboxStore, InMemoryOutboxStore, InMemorySagaRepository, InboxStore,
    StorageSessionFactory, Stores,
};
use crate::transport::channel::ChannelTransportHost;
use crate::transport::TransportHost;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PlaceOrder {
    order_id: String,
}

impl Message for PlaceOrder {
    const MESSAGE_TYPE: &'static str = "orders.place-order";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct OrderPlaced {
    order_id: String,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "orders.order-placed";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct GetStock {
    sku: String,
}

impl Message for GetStock {
    const MESSAGE_TYPE: &'static str = "inventory.get-stock";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StockLevel {
    sku: String,
    available: u32,
}

impl Message for StockLevel {
    const MESSAGE_TYPE: &'static str = "inventory.stock-level";
}

fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

fn bus_address() -> Url {
    url("channel://local/bus")
}

fn channel_hosts() -> (Arc<ChannelTransportHost>, Arc<TransportHostProvider>) {
    let host = Arc::new(ChannelTransportHost::local().unwrap());
    let provider = TransportHostProvider::from_hosts([host.clone() as Arc<dyn TransportHost>]);
    (host, Arc::new(provider))
}

/// Consumer forwarding every message it sees.
fn forwarding<M: Message + Clone>() -> (impl Consumer<M>, UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = consumer_fn(move |context: ConsumeContext<M>| {
        let tx: UnboundedSender<M> = tx.clone();
        async move {
            let _ = tx.send(context.into_message());
            Ok(())
        }
    });
    (consumer, rx)
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

fn order(id: &str) -> PlaceOrder {
    PlaceOrder {
        order_id: id.to_string(),
    }
}

// ============================================================================
// Send / publish
// ============================================================================

#[tokio::test]
async fn test_send_reaches_consumer() {
    let (_, hosts) = channel_hosts();
    let (consumer, mut rx) = forwarding::<PlaceOrder>();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer);
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.send(&url("channel://local/orders"), &order("o-1"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, Some(order("o-1")));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_fans_out_to_subscribed_endpoints() {
    let (_, hosts) = channel_hosts();
    let (billing, mut billing_rx) = forwarding::<OrderPlaced>();
    let (shipping, mut shipping_rx) = forwarding::<OrderPlaced>();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/billing"), |e| {
            e.consumer::<OrderPlaced, _>(billing);
        })
        .endpoint(url("channel://local/shipping"), |e| {
            e.consumer::<OrderPlaced, _>(shipping);
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let event = OrderPlaced {
        order_id: "o-2".to_string(),
    };
    bus.publish(&event, &CancellationToken::new()).await.unwrap();

    assert_eq!(next(&mut billing_rx).await, Some(event.clone()));
    assert_eq!(next(&mut shipping_rx).await, Some(event));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_sees_standard_headers() {
    let (_, hosts) = channel_hosts();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer_fn(move |context: ConsumeContext<PlaceOrder>| {
                let tx = tx.clone();
                async move {
                    let message = context.transport_message();
                    let _ = tx.send((
                        message.message_type().map(str::to_string),
                        message.content_type().map(str::to_string),
                        message.message_id().is_some(),
                        message.sent_time().is_some(),
                    ));
                    Ok(())
                }
            }));
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.send(&url("channel://local/orders"), &order("o-3"), &CancellationToken::new())
        .await
        .unwrap();

    let (message_type, content_type, has_id, has_sent_time) = next(&mut rx).await.unwrap();
    assert_eq!(message_type.as_deref(), Some("orders.place-order"));
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert!(has_id);
    assert!(has_sent_time);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_follow_up_carries_conversation() {
    let (_, hosts) = channel_hosts();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer_fn(|context: ConsumeContext<PlaceOrder>| async move {
                let placed = OrderPlaced {
                    order_id: context.message().order_id.clone(),
                };
                context.publish(&placed).await
            }));
        })
        .endpoint(url("channel://local/audit"), |e| {
            e.consumer::<OrderPlaced, _>(consumer_fn(move |context: ConsumeContext<OrderPlaced>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(context.conversation_id());
                    Ok(())
                }
            }));
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let conversation = Uuid::now_v7();
    let command = TransportMessage::builder(serde_json::to_vec(&order("o-4")).unwrap())
        .content_type("application/json")
        .message_type(PlaceOrder::MESSAGE_TYPE)
        .message_id(Uuid::now_v7())
        .conversation_id(Some(conversation))
        .build();
    bus.send_message(&url("channel://local/orders"), command, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, Some(Some(conversation)));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_consumer_is_dead_lettered() {
    let (host, hosts) = channel_hosts();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer_fn(|_context: ConsumeContext<PlaceOrder>| async {
                Err(BusError::Consumer("rejected".to_string()))
            }))
            .fault_settings(ReceiveEndpointFaultSettings {
                dead_letter_address: Some(url("channel://local/orders-errors")),
                ..Default::default()
            });
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.send(&url("channel://local/orders"), &order("o-5"), &CancellationToken::new())
        .await
        .unwrap();

    let mut dead_lettered = false;
    for _ in 0..100 {
        if host.queued("orders-errors") == 1 {
            dead_lettered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dead_lettered);
    bus.stop().await.unwrap();
}

// ============================================================================
// Inbox
// ============================================================================

#[tokio::test]
async fn test_admit_classifies_deliveries() {
    let inbox = InMemoryInboxStore::new();
    let id = Uuid::now_v7();

    assert_eq!(admit(&inbox, Some(id), "billing").await.unwrap(), InboxOutcome::Accepted);
    // Not yet processed: a redelivery is accepted again.
    assert_eq!(admit(&inbox, Some(id), "billing").await.unwrap(), InboxOutcome::Accepted);

    inbox.mark_processed(id, "billing", Utc::now()).await.unwrap();
    assert_eq!(admit(&inbox, Some(id), "billing").await.unwrap(), InboxOutcome::Duplicate);
    assert_eq!(admit(&inbox, Some(id), "shipping").await.unwrap(), InboxOutcome::Accepted);
    assert_eq!(admit(&inbox, None, "billing").await.unwrap(), InboxOutcome::Untracked);
}

#[tokio::test]
async fn test_inbox_consumer_skips_duplicates() {
    let (_, hosts) = channel_hosts();
    let inbox: Arc<dyn InboxStore> = Arc::new(InMemoryInboxStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counted = calls.clone();
    let inner = consumer_fn(move |_context: ConsumeContext<PlaceOrder>| {
        let counted = counted.clone();
        let tx = tx.clone();
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
            Ok(())
        }
    });
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(InboxConsumer::new(inbox.clone(), "order-handler", inner));
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let message_id = Uuid::now_v7();
    let duplicate = TransportMessage::builder(serde_json::to_vec(&order("o-6")).unwrap())
        .content_type("application/json")
        .message_type(PlaceOrder::MESSAGE_TYPE)
        .message_id(message_id)
        .build();
    for _ in 0..2 {
        bus.send_message(&url("channel://local/orders"), duplicate.clone(), &CancellationToken::new())
            .await
            .unwrap();
    }

    assert!(next(&mut rx).await.is_some());
    // Give the second delivery time to be handled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = inbox.get(message_id, "order-handler").await.unwrap().unwrap();
    assert!(state.processed_time.is_some());
    bus.stop().await.unwrap();
}

// ============================================================================
// Request / response
// ============================================================================

#[tokio::test]
async fn test_request_gets_response() {
    let (_, hosts) = channel_hosts();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/inventory"), |e| {
            e.consumer::<GetStock, _>(consumer_fn(|context: ConsumeContext<GetStock>| async move {
                let level = StockLevel {
                    sku: context.message().sku.clone(),
                    available: 7,
                };
                context.respond(&level).await
            }));
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let client = bus.request_client::<GetStock>(url("channel://local/inventory"));
    let response: StockLevel = client
        .get_response(
            &GetStock {
                sku: "sku-1".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.available, 7);
    assert_eq!(bus.pending_requests(), 0);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let (_, hosts) = channel_hosts();
    let bus = Bus::builder(bus_address(), hosts)
        .request_timeout(Duration::from_millis(50))
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let client = bus.request_client::<GetStock>(url("channel://local/nobody"));
    let err = client
        .get_response::<StockLevel>(
            &GetStock {
                sku: "sku-2".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::Timeout(_)));
    assert_eq!(bus.pending_requests(), 0);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_respond_without_response_address_fails() {
    let (_, hosts) = channel_hosts();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let bus = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/inventory"), |e| {
            e.consumer::<GetStock, _>(consumer_fn(move |context: ConsumeContext<GetStock>| {
                let tx = tx.clone();
                async move {
                    let result = context
                        .respond(&StockLevel {
                            sku: String::new(),
                            available: 0,
                        })
                        .await;
                    let _ = tx.send(matches!(result, Err(BusError::NoResponseAddress(_))));
                    Ok(())
                }
            }));
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.send(
        &url("channel://local/inventory"),
        &GetStock {
            sku: "sku-3".to_string(),
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(next(&mut rx).await, Some(true));
    bus.stop().await.unwrap();
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn test_outbox_routing_defers_delivery_to_dispatcher() {
    let (_, hosts) = channel_hosts();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let (consumer, mut rx) = forwarding::<PlaceOrder>();
    let bus = Bus::builder(bus_address(), hosts)
        .outbox(
            outbox.clone(),
            OutboxDispatchOptions {
                poll_interval_ms: 10,
                ..Default::default()
            },
        )
        .route_through_outbox(true)
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer);
        })
        .build()
        .await
        .unwrap();

    bus.send(&url("channel://local/orders"), &order("o-7"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outbox.get_pending(10).await.unwrap().len(), 1);

    bus.start().await.unwrap();
    assert_eq!(next(&mut rx).await, Some(order("o-7")));
    bus.stop().await.unwrap();
    assert!(outbox.get_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_route_through_outbox_requires_store() {
    let (_, hosts) = channel_hosts();
    let result = Bus::builder(bus_address(), hosts)
        .route_through_outbox(true)
        .build()
        .await;
    assert!(matches!(result, Err(BusError::Configuration(_))));
}

#[tokio::test]
async fn test_staged_message_published_after_commit() {
    let (_, hosts) = channel_hosts();
    let stores = Stores::in_memory();
    let (consumer, mut rx) = forwarding::<PlaceOrder>();
    let bus = Bus::builder(bus_address(), hosts)
        .outbox(stores.outbox.clone(), OutboxDispatchOptions::default())
        .endpoint(url("channel://local/orders"), |e| {
            e.consumer::<PlaceOrder, _>(consumer);
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let mut session = stores.sessions.begin().await.unwrap();
    let staged = bus
        .stage_send(session.as_mut(), &url("channel://local/orders"), &order("o-8"))
        .await
        .unwrap();
    assert!(stores.outbox.get_pending(10).await.unwrap().is_empty());
    session.commit().await.unwrap();
    assert_eq!(stores.outbox.get_pending(10).await.unwrap().len(), 1);

    assert!(bus.publish_staged(&staged, &CancellationToken::new()).await.unwrap());
    assert_eq!(next(&mut rx).await, Some(order("o-8")));
    assert!(stores.outbox.get_pending(10).await.unwrap().is_empty());
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_rolled_back_stage_leaves_nothing() {
    let (_, hosts) = channel_hosts();
    let stores = Stores::in_memory();
    let bus = Bus::builder(bus_address(), hosts)
        .outbox(stores.outbox.clone(), OutboxDispatchOptions::default())
        .build()
        .await
        .unwrap();

    let mut session = stores.sessions.begin().await.unwrap();
    bus.stage_publish(
        session.as_mut(),
        &OrderPlaced {
            order_id: "o-9".to_string(),
        },
    )
    .await
    .unwrap();
    session.rollback().await.unwrap();

    assert!(stores.outbox.get_pending(10).await.unwrap().is_empty());
}

// ============================================================================
// Sagas
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Fulfilment {
    order_id: String,
}

#[tokio::test]
async fn test_saga_endpoint_emits_effects_after_save() {
    let (_, hosts) = channel_hosts();
    let repository = Arc::new(InMemorySagaRepository::new());
    let (consumer, mut rx) = forwarding::<OrderPlaced>();
    let definition = SagaDefinition::<Fulfilment>::new("fulfilment").starts_with::<PlaceOrder, _>(
        |ctx, command| {
            ctx.state_mut().order_id = command.order_id.clone();
            ctx.publish(&OrderPlaced {
                order_id: command.order_id,
            })?;
            Ok(())
        },
    );
    let bus = Bus::builder(bus_address(), hosts)
        .saga_repository(repository.clone())
        .endpoint(url("channel://local/fulfilment"), |e| {
            e.saga(definition);
        })
        .endpoint(url("channel://local/audit"), |e| {
            e.consumer::<OrderPlaced, _>(consumer);
        })
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let correlation_id = Uuid::now_v7();
    let command = TransportMessage::builder(serde_json::to_vec(&order("o-10")).unwrap())
        .content_type("application/json")
        .message_type(PlaceOrder::MESSAGE_TYPE)
        .message_id(Uuid::now_v7())
        .correlation_id(Some(correlation_id))
        .build();
    bus.send_message(&url("channel://local/fulfilment"), command, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        next(&mut rx).await.map(|event| event.order_id),
        Some("o-10".to_string())
    );
    let stored = crate::storage::SagaRepository::get(repository.as_ref(), correlation_id, "fulfilment")
        .await
        .unwrap();
    assert_eq!(stored.map(|state| state.version), Some(1));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_saga_without_repository_is_rejected() {
    let (_, hosts) = channel_hosts();
    let result = Bus::builder(bus_address(), hosts)
        .endpoint(url("channel://local/fulfilment"), |e| {
            e.saga(SagaDefinition::<Fulfilment>::new("fulfilment").starts_with::<PlaceOrder, _>(|_, _| Ok(())));
        })
        .build()
        .await;
    assert!(matches!(result, Err(BusError::Configuration(_))));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_unknown_scheme_fails_build() {
    let (_, hosts) = channel_hosts();
    let result = Bus::builder(bus_address(), hosts)
        .endpoint(url("kafka://cluster/orders"), |_| {})
        .build()
        .await;
    assert!(matches!(
        result,
        Err(BusError::Transport(TransportError::Configuration(_)))
    ));
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let (_, hosts) = channel_hosts();
    let stores = Stores::in_memory();
    let bus = Bus::builder(bus_address(), hosts)
        .outbox(stores.outbox.clone(), OutboxDispatchOptions::default())
        .scheduled_store(stores.scheduled.clone(), ScheduledDispatchOptions::default())
        .build()
        .await
        .unwrap();

    bus.start().await.unwrap();
    bus.start().await.unwrap();
    assert!(bus.is_running().await);

    bus.stop().await.unwrap();
    assert!(!bus.is_running().await);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_scheduled_send_is_persisted() {
    let (_, hosts) = channel_hosts();
    let stores = Stores::in_memory();
    let bus = Bus::builder(bus_address(), hosts)
        .scheduled_store(stores.scheduled.clone(), ScheduledDispatchOptions::default())
        .build()
        .await
        .unwrap();

    let handle = bus
        .schedule_send_after(&url("channel://local/orders"), &order("o-11"), Duration::from_secs(60))
        .await
        .unwrap();

    let stored = stores.scheduled.get(handle.token_id()).await.unwrap().unwrap();
    assert_eq!(stored.message_type, PlaceOrder::MESSAGE_TYPE);
    assert_eq!(stored.destination(), Some(url("channel://local/orders")));
    assert!(handle.cancel().await.unwrap());
}
