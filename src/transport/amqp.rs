//! AMQP (RabbitMQ) transport.
//!
//! - send: default exchange, routing key = queue name from the address
//! - publish: durable fanout exchange per message type
//! - receive: durable queue, bound to the fanout exchange of every
//!   subscribed message type
//!
//! Envelope fields travel as AMQP properties plus string headers. Native
//! dead-lettering uses the queue's `x-dead-letter-exchange` argument when
//! `dead_letter_exchange` is configured.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::registry::TransportFactory;
use super::settings::{AmqpSettings, TransportSettings};
use super::topology;
use super::{
    Disposition, EndpointSet, PublishTransport, ReceiveContext, ReceiveEndpoint,
    ReceiveEndpointConfig, ReceivePipeline, Result, SendTransport, TransportError, TransportHost,
};
use crate::message::{headers, Headers, TransportMessage};
use crate::resilience::{wrap_publish, wrap_send, ResiliencePipeline, TransportResilienceOptions};
use crate::utils::bootstrap::connect_with_retry;
use crate::utils::retry::connection_backoff;

/// Schemes served by the AMQP transport.
pub const SCHEMES: &[&str] = &["amqp", "amqps", "rabbitmq"];

const POOL_SIZE: usize = 10;

fn failure(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::TransportFailure(format!("{context}: {e}"))
}

/// Pooled connections plus the entities already declared through them.
struct Broker {
    pool: Pool,
    exchange_prefix: Option<String>,
    dead_letter_exchange: Option<String>,
    declared: Mutex<HashSet<String>>,
}

impl Broker {
    async fn channel(&self) -> Result<Channel> {
        let connection = self
            .pool
            .get()
            .await
            .map_err(|e| failure("Failed to get connection from pool", e))?;
        connection
            .create_channel()
            .await
            .map_err(|e| failure("Failed to create channel", e))
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    fn remember(&self, name: &str) {
        self.declared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }

    fn exchange_for(&self, message_type: &str) -> String {
        topology::topic_name(message_type, self.exchange_prefix.as_deref())
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        arguments
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<()> {
        if self.is_declared(queue) {
            return Ok(());
        }
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                self.queue_arguments(),
            )
            .await
            .map_err(|e| failure(&format!("Failed to declare queue '{queue}'"), e))?;
        self.remember(queue);
        Ok(())
    }

    async fn declare_exchange(&self, channel: &Channel, exchange: &str) -> Result<()> {
        if self.is_declared(exchange) {
            return Ok(());
        }
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| failure(&format!("Failed to declare exchange '{exchange}'"), e))?;
        self.remember(exchange);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let channel = self.channel().await?;
        if exchange.is_empty() {
            self.declare_queue(&channel, routing_key).await?;
        } else {
            self.declare_exchange(&channel, exchange).await?;
        }
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| failure("Failed to enable publisher confirms", e))?;

        let publish = async {
            let confirm = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    message.body(),
                    properties(message),
                )
                .await
                .map_err(|e| failure("Failed to publish", e))?;
            let confirmation = confirm
                .await
                .map_err(|e| failure("Publish confirmation failed", e))?;
            if confirmation.is_nack() {
                return Err(TransportError::TransportFailure(
                    "broker rejected the message".to_string(),
                ));
            }
            Ok(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            published = publish => published,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

fn properties(message: &TransportMessage) -> BasicProperties {
    let mut table = FieldTable::default();
    for (key, value) in message.wire_headers().iter() {
        table.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(LongString::from(value.to_string())),
        );
    }

    let mut properties = BasicProperties::default()
        .with_delivery_mode(2) // persistent
        .with_headers(table);
    if let Some(content_type) = message.content_type() {
        properties = properties.with_content_type(ShortString::from(content_type.to_string()));
    }
    if let Some(id) = message.message_id() {
        properties = properties.with_message_id(ShortString::from(id.to_string()));
    }
    if let Some(id) = message.correlation_id() {
        properties = properties.with_correlation_id(ShortString::from(id.to_string()));
    }
    if let Some(message_type) = message.message_type() {
        properties = properties.with_kind(ShortString::from(message_type.to_string()));
    }
    if let Some(sent) = message.sent_time() {
        properties = properties.with_timestamp(sent.timestamp().max(0) as u64);
    }
    properties
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn to_transport_message(delivery: &Delivery) -> TransportMessage {
    let mut wire = Headers::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let Some(text) = header_text(value) {
                wire.insert(key.as_str(), text);
            }
        }
    }
    // Producers other than courier only set the properties.
    let fallbacks = [
        (headers::CONTENT_TYPE, delivery.properties.content_type()),
        (headers::MESSAGE_ID, delivery.properties.message_id()),
        (headers::CORRELATION_ID, delivery.properties.correlation_id()),
        (headers::MESSAGE_TYPE, delivery.properties.kind()),
    ];
    for (name, value) in fallbacks {
        if let (false, Some(value)) = (wire.contains_key(name), value) {
            wire.insert(name, value.as_str());
        }
    }
    TransportMessage::from_wire(delivery.data.clone(), wire)
}

// ============================================================================
// Host
// ============================================================================

/// RabbitMQ transport host.
pub struct AmqpTransportHost {
    address: Url,
    url: String,
    prefetch_count: u16,
    broker: Arc<Broker>,
    resilience: Option<TransportResilienceOptions>,
    pipeline: ResiliencePipeline,
    endpoints: EndpointSet,
}

impl AmqpTransportHost {
    /// Build the host. The connection pool connects lazily; [`start`]
    /// verifies the broker is reachable.
    ///
    /// [`start`]: TransportHost::start
    pub fn new(settings: &AmqpSettings) -> Result<Self> {
        let address = Url::parse(&settings.address).map_err(|e| {
            TransportError::Configuration(format!("invalid amqp address '{}': {e}", settings.address))
        })?;
        let manager = Manager::new(settings.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| TransportError::Configuration(format!("Failed to create pool: {e}")))?;

        info!(address = %address, url = %settings.url, "AMQP transport host initialized");

        Ok(Self {
            address,
            url: settings.url.clone(),
            prefetch_count: settings.prefetch_count.max(1),
            broker: Arc::new(Broker {
                pool,
                exchange_prefix: settings.exchange_prefix.clone(),
                dead_letter_exchange: settings.dead_letter_exchange.clone(),
                declared: Mutex::new(HashSet::new()),
            }),
            pipeline: ResiliencePipeline::new(settings.resilience.as_ref()),
            resilience: settings.resilience.clone(),
            endpoints: EndpointSet::new(),
        })
    }
}

#[async_trait]
impl TransportHost for AmqpTransportHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let broker = self.broker.clone();
        connect_with_retry("amqp", &self.url, || {
            let broker = broker.clone();
            async move { broker.channel().await.map(|_| ()) }
        })
        .await?;
        info!(address = %self.address, endpoints = self.endpoints.len(), "Starting AMQP transport host");
        self.endpoints.start_all(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        info!(address = %self.address, "Stopping AMQP transport host");
        let stopped = self.endpoints.stop_all().await;
        self.broker.pool.close();
        stopped
    }

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(AmqpSendTransport {
            broker: self.broker.clone(),
            queue: topology::queue_name(address)?,
        });
        Ok(wrap_send(transport, &self.pipeline))
    }

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>> {
        let transport = Arc::new(AmqpPublishTransport {
            exchange: self.broker.exchange_for(message_type),
            broker: self.broker.clone(),
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
        let exchanges = config
            .subscriptions
            .iter()
            .map(|message_type| self.broker.exchange_for(message_type))
            .collect();

        let endpoint = Arc::new(AmqpReceiveEndpoint {
            consumer: Arc::new(QueueConsumer {
                input_address: config.input_address.clone(),
                source_address: self.address.clone(),
                queue,
                exchanges,
                prefetch_count: self.prefetch_count,
                broker: self.broker.clone(),
                pipeline: Arc::new(pipeline),
            }),
            running: Mutex::new(None),
        });
        self.endpoints.attach(endpoint).await
    }
}

// ============================================================================
// Send / publish
// ============================================================================

struct AmqpSendTransport {
    broker: Arc<Broker>,
    queue: String,
}

#[async_trait]
impl SendTransport for AmqpSendTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.broker.publish("", &self.queue, message, cancel).await?;
        debug!(queue = %self.queue, message_id = ?message.message_id(), "Sent message to AMQP queue");
        Ok(())
    }
}

struct AmqpPublishTransport {
    broker: Arc<Broker>,
    exchange: String,
}

#[async_trait]
impl PublishTransport for AmqpPublishTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.broker.publish(&self.exchange, "", message, cancel).await?;
        debug!(exchange = %self.exchange, message_id = ?message.message_id(), "Published message to AMQP exchange");
        Ok(())
    }
}

// ============================================================================
// Receive endpoint
// ============================================================================

struct AmqpReceiveEndpoint {
    consumer: Arc<QueueConsumer>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AmqpReceiveEndpoint {
    fn running(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReceiveEndpoint for AmqpReceiveEndpoint {
    fn input_address(&self) -> &Url {
        &self.consumer.input_address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        let token = cancel.child_token();
        let handle = tokio::spawn(self.consumer.clone().consume_with_reconnect(token.clone()));
        *running = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running().take();
        let Some((token, handle)) = running else {
            return Ok(());
        };
        token.cancel();
        handle.await.map_err(|e| {
            TransportError::TransportFailure(format!(
                "AMQP consumer for '{}' panicked: {e}",
                self.consumer.queue
            ))
        })?;
        info!(queue = %self.consumer.queue, "AMQP consumer stopped");
        Ok(())
    }
}

struct QueueConsumer {
    input_address: Url,
    source_address: Url,
    queue: String,
    exchanges: Vec<String>,
    prefetch_count: u16,
    broker: Arc<Broker>,
    pipeline: Arc<ReceivePipeline>,
}

impl QueueConsumer {
    /// Consume until cancelled, reconnecting with backoff when the channel
    /// or the broker goes away.
    async fn consume_with_reconnect(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = connection_backoff().build();

        while !cancel.is_cancelled() {
            match self.setup_consumer().await {
                Ok(mut consumer) => {
                    info!(queue = %self.queue, "Consumer connected, processing messages");
                    backoff = connection_backoff().build();

                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = consumer.next() => next,
                        };
                        match next {
                            Some(Ok(delivery)) => self.process_delivery(delivery, &cancel).await,
                            Some(Err(e)) => {
                                error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => {
                                info!(queue = %self.queue, "Consumer stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to set up consumer, retrying after backoff");
                }
            }

            let delay = backoff
                .next()
                .unwrap_or_else(|| std::time::Duration::from_secs(5));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn setup_consumer(&self) -> Result<lapin::Consumer> {
        let channel = self.broker.channel().await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| failure("Failed to set prefetch", e))?;
        self.broker.declare_queue(&channel, &self.queue).await?;

        for exchange in &self.exchanges {
            self.broker.declare_exchange(&channel, exchange).await?;
            channel
                .queue_bind(
                    &self.queue,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| failure(&format!("Failed to bind queue '{}'", self.queue), e))?;
            debug!(queue = %self.queue, exchange = %exchange, "Bound queue to exchange");
        }

        channel
            .basic_consume(
                &self.queue,
                &format!("courier-{}", self.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| failure("Failed to start consumer", e))
    }

    async fn process_delivery(&self, delivery: Delivery, cancel: &CancellationToken) {
        let context = Arc::new(ReceiveContext::new(
            to_transport_message(&delivery),
            Some(self.source_address.clone()),
            self.input_address.clone(),
            cancel.child_token(),
        ));
        let disposition = self.pipeline.process(context).await;

        let settled = match disposition {
            Disposition::Acknowledge | Disposition::DeadLettered => {
                delivery.ack(BasicAckOptions::default()).await
            }
            Disposition::TransportDeadLetter => {
                if self.broker.dead_letter_exchange.is_none() {
                    warn!(queue = %self.queue, "No dead-letter exchange configured, message will be dropped by the broker");
                }
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
            }
            Disposition::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = settled {
            error!(queue = %self.queue, error = %e, ?disposition, "Failed to settle delivery");
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`AmqpTransportHost`]s for `amqp://`, `amqps://` and `rabbitmq://`.
pub struct AmqpTransportFactory;

#[async_trait]
impl TransportFactory for AmqpTransportFactory {
    fn name(&self) -> &str {
        "RabbitMQ"
    }

    fn supported_schemes(&self) -> &[&'static str] {
        SCHEMES
    }

    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>> {
        match settings {
            TransportSettings::Amqp(settings) => Ok(Arc::new(AmqpTransportHost::new(settings)?)),
            other => Err(TransportError::Configuration(format!(
                "amqp transport cannot use '{}' settings",
                other.kind()
            ))),
        }
    }
}
