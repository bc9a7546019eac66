//! In-memory channel transport.
//!
//! Queues are tokio mpsc channels keyed by the first path segment of the
//! address. Publishing fans a copy out to every queue subscribed to the
//! message type. Intended for local development, tests and single-process
//! deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::registry::TransportFactory;
use super::settings::{ChannelSettings, TransportSettings};
use super::topology;
use super::{
    Disposition, EndpointSet, PublishTransport, ReceiveContext, ReceiveEndpoint,
    ReceiveEndpointConfig, ReceivePipeline, Result, SendTransport, TransportError, TransportHost,
};
use crate::message::TransportMessage;
use crate::resilience::{wrap_publish, wrap_send, ResiliencePipeline, TransportResilienceOptions};

/// Schemes served by the channel transport.
pub const SCHEMES: &[&str] = &["channel", "loopback"];

#[derive(Debug, Clone)]
struct Delivery {
    message: TransportMessage,
    delivery_count: u32,
}

struct Queue {
    sender: mpsc::Sender<Delivery>,
    receiver: Mutex<Option<mpsc::Receiver<Delivery>>>,
    /// Settled deliveries that found the queue full. Drained before the
    /// channel, so a requeue never waits on and never loses to new sends.
    parked: Mutex<VecDeque<Delivery>>,
    parked_ready: Notify,
}

impl Queue {
    fn park(&self, delivery: Delivery) {
        lock(&self.parked).push_back(delivery);
        self.parked_ready.notify_one();
    }

    fn unpark(&self) -> Option<Delivery> {
        lock(&self.parked).pop_front()
    }

    fn parked_len(&self) -> usize {
        lock(&self.parked).len()
    }
}

/// Queues and publish subscriptions shared by a host's transports.
struct Router {
    capacity: usize,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
}

impl Router {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = read(&self.queues).get(name) {
            return queue.clone();
        }
        write(&self.queues)
            .entry(name.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.capacity);
                Arc::new(Queue {
                    sender,
                    receiver: Mutex::new(Some(receiver)),
                    parked: Mutex::new(VecDeque::new()),
                    parked_ready: Notify::new(),
                })
            })
            .clone()
    }

    fn subscribe(&self, message_type: &str, queue: &str) {
        let mut subscriptions = write(&self.subscriptions);
        let queues = subscriptions.entry(message_type.to_string()).or_default();
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
    }

    fn subscribers(&self, message_type: &str) -> Vec<String> {
        read(&self.subscriptions)
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn enqueue(&self, queue: &str, delivery: Delivery, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let sender = self.queue(queue).sender.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            sent = sender.send(delivery) => sent.map_err(|_| {
                TransportError::TransportFailure(format!("queue '{queue}' is closed"))
            }),
        }
    }

    /// Non-blocking re-enqueue used when settling a delivery. A full queue
    /// parks the delivery instead of dropping it.
    fn requeue(&self, queue: &str, delivery: Delivery) {
        let target = self.queue(queue);
        if let Err(e) = target.sender.try_send(delivery) {
            let delivery = match e {
                mpsc::error::TrySendError::Full(delivery) => delivery,
                mpsc::error::TrySendError::Closed(delivery) => delivery,
            };
            debug!(queue = %queue, "Queue full, parking settled message");
            target.park(delivery);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}-dlq")
}

// ============================================================================
// Host
// ============================================================================

/// In-memory transport host.
pub struct ChannelTransportHost {
    address: Url,
    router: Arc<Router>,
    max_deliveries: u32,
    resilience: Option<TransportResilienceOptions>,
    pipeline: ResiliencePipeline,
    endpoints: EndpointSet,
}

impl ChannelTransportHost {
    pub fn new(settings: &ChannelSettings) -> Result<Self> {
        let address = Url::parse(&settings.address).map_err(|e| {
            TransportError::Configuration(format!("invalid channel address '{}': {e}", settings.address))
        })?;

        info!(address = %address, capacity = settings.capacity, "Channel transport host initialized");

        Ok(Self {
            address,
            router: Arc::new(Router::new(settings.capacity)),
            max_deliveries: settings.max_deliveries.max(1),
            pipeline: ResiliencePipeline::new(settings.resilience.as_ref()),
            resilience: settings.resilience.clone(),
            endpoints: EndpointSet::new(),
        })
    }

    /// Host with default settings at `channel://local`.
    pub fn local() -> Result<Self> {
        Self::new(&ChannelSettings::default())
    }

    /// Messages waiting in `queue`. Dead letters sit in `{queue}-dlq`.
    pub fn queued(&self, queue: &str) -> usize {
        let queue = self.router.queue(queue);
        queue.sender.max_capacity() - queue.sender.capacity() + queue.parked_len()
    }
}

#[async_trait]
impl TransportHost for ChannelTransportHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(address = %self.address, endpoints = self.endpoints.len(), "Starting channel transport host");
        self.endpoints.start_all(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        info!(address = %self.address, "Stopping channel transport host");
        self.endpoints.stop_all().await
    }

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(ChannelSendTransport {
            router: self.router.clone(),
            queue: topology::queue_name(address)?,
        });
        Ok(wrap_send(transport, &self.pipeline))
    }

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>> {
        let transport = Arc::new(ChannelPublishTransport {
            router: self.router.clone(),
            message_type: message_type.to_string(),
        });
        Ok(wrap_publish(transport, &self.pipeline))
    }

    async fn connect_receive_endpoint(
        &self,
        config: ReceiveEndpointConfig,
    ) -> Result<Arc<dyn ReceiveEndpoint>> {
        if let Some(existing) = self.endpoints.get(&config.input_address) {
            return Ok(existing);
        }

        let queue = topology::queue_name(&config.input_address)?;
        let pipeline = ReceivePipeline::build(self, &config, self.resilience.as_ref()).await?;
        for message_type in &config.subscriptions {
            self.router.subscribe(message_type, &queue);
        }

        let endpoint = Arc::new(ChannelReceiveEndpoint {
            input_address: config.input_address.clone(),
            source_address: self.address.clone(),
            queue,
            max_deliveries: self.max_deliveries,
            router: self.router.clone(),
            pipeline: Arc::new(pipeline),
            state: Mutex::new(EndpointState::default()),
        });
        self.endpoints.attach(endpoint).await
    }
}

// ============================================================================
// Send / publish
// ============================================================================

struct ChannelSendTransport {
    router: Arc<Router>,
    queue: String,
}

#[async_trait]
impl SendTransport for ChannelSendTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let delivery = Delivery {
            message: message.clone(),
            delivery_count: 0,
        };
        self.router.enqueue(&self.queue, delivery, cancel).await?;
        debug!(queue = %self.queue, message_id = ?message.message_id(), "Sent message to channel queue");
        Ok(())
    }
}

struct ChannelPublishTransport {
    router: Arc<Router>,
    message_type: String,
}

#[async_trait]
impl PublishTransport for ChannelPublishTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let subscribers = self.router.subscribers(&self.message_type);
        if subscribers.is_empty() {
            debug!(message_type = %self.message_type, "Published message (no subscribers)");
            return Ok(());
        }
        for queue in &subscribers {
            let delivery = Delivery {
                message: message.clone(),
                delivery_count: 0,
            };
            self.router.enqueue(queue, delivery, cancel).await?;
        }
        debug!(
            message_type = %self.message_type,
            subscribers = subscribers.len(),
            "Published message to channel subscribers"
        );
        Ok(())
    }
}

// ============================================================================
// Receive endpoint
// ============================================================================

#[derive(Default)]
struct EndpointState {
    receiver: Option<mpsc::Receiver<Delivery>>,
    running: Option<(CancellationToken, JoinHandle<mpsc::Receiver<Delivery>>)>,
}

struct ChannelReceiveEndpoint {
    input_address: Url,
    source_address: Url,
    queue: String,
    max_deliveries: u32,
    router: Arc<Router>,
    pipeline: Arc<ReceivePipeline>,
    state: Mutex<EndpointState>,
}

impl ChannelReceiveEndpoint {
    fn state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReceiveEndpoint for ChannelReceiveEndpoint {
    fn input_address(&self) -> &Url {
        &self.input_address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state();
        if state.running.is_some() {
            return Ok(());
        }

        let receiver = match state.receiver.take() {
            Some(receiver) => receiver,
            None => self
                .router
                .queue(&self.queue)
                .receiver
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or_else(|| {
                    TransportError::Configuration(format!(
                        "queue '{}' already has a consumer",
                        self.queue
                    ))
                })?,
        };

        let token = cancel.child_token();
        let consumer = Consumer {
            input_address: self.input_address.clone(),
            source_address: self.source_address.clone(),
            queue: self.queue.clone(),
            max_deliveries: self.max_deliveries,
            router: self.router.clone(),
            pipeline: self.pipeline.clone(),
        };
        let handle = tokio::spawn(consumer.run(receiver, token.clone()));
        state.running = Some((token, handle));

        info!(queue = %self.queue, "Channel consumer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.state().running.take();
        let Some((token, handle)) = running else {
            return Ok(());
        };

        token.cancel();
        match handle.await {
            Ok(receiver) => {
                self.state().receiver = Some(receiver);
                info!(queue = %self.queue, "Channel consumer stopped");
                Ok(())
            }
            Err(e) => Err(TransportError::TransportFailure(format!(
                "channel consumer for '{}' panicked: {e}",
                self.queue
            ))),
        }
    }
}

struct Consumer {
    input_address: Url,
    source_address: Url,
    queue: String,
    max_deliveries: u32,
    router: Arc<Router>,
    pipeline: Arc<ReceivePipeline>,
}

impl Consumer {
    async fn run(
        self,
        mut receiver: mpsc::Receiver<Delivery>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Delivery> {
        let queue = self.router.queue(&self.queue);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delivery = match queue.unpark() {
                Some(delivery) => delivery,
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.parked_ready.notified() => continue,
                    next = receiver.recv() => match next {
                        Some(delivery) => delivery,
                        None => break,
                    },
                },
            };

            let context = Arc::new(ReceiveContext::new(
                delivery.message.clone(),
                Some(self.source_address.clone()),
                self.input_address.clone(),
                cancel.child_token(),
            ));
            let disposition = self.pipeline.process(context).await;
            self.settle(delivery, disposition);
        }
        receiver
    }

    fn settle(&self, mut delivery: Delivery, disposition: Disposition) {
        match disposition {
            Disposition::Acknowledge | Disposition::DeadLettered => {}
            Disposition::TransportDeadLetter => {
                warn!(queue = %self.queue, "Moving message to dead-letter queue");
                delivery.delivery_count = 0;
                self.router.requeue(&dead_letter_queue(&self.queue), delivery);
            }
            Disposition::Requeue => {
                delivery.delivery_count += 1;
                if delivery.delivery_count >= self.max_deliveries {
                    warn!(
                        queue = %self.queue,
                        deliveries = delivery.delivery_count,
                        "Delivery limit reached, moving message to dead-letter queue"
                    );
                    delivery.delivery_count = 0;
                    self.router.requeue(&dead_letter_queue(&self.queue), delivery);
                } else {
                    self.router.requeue(&self.queue, delivery);
                }
            }
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`ChannelTransportHost`]s for `channel://` and `loopback://`.
pub struct ChannelTransportFactory;

#[async_trait]
impl TransportFactory for ChannelTransportFactory {
    fn name(&self) -> &str {
        "Channel"
    }

    fn supported_schemes(&self) -> &[&'static str] {
        SCHEMES
    }

    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>> {
        match settings {
            TransportSettings::Channel(settings) => Ok(Arc::new(ChannelTransportHost::new(settings)?)),
            other => Err(TransportError::Configuration(format!(
                "channel transport cannot use '{}' settings",
                other.kind()
            ))),
        }
    }
}
