//! Kafka transport.
//!
//! - send: topic named by the address's first path segment
//! - publish: topic per message type, `{topic_prefix}-{message-type}`
//! - receive: one consumer group per endpoint, `{group_id}.{queue}`,
//!   subscribed to its own topic plus the topics of subscribed types
//!
//! Offsets are committed after the message is settled. A message to
//! requeue is re-read by seeking back to its offset. Kafka has no native
//! dead-lettering, so transport dead letters go to `{topic}-dlq`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::receive::dead_letter_copy;
use super::registry::TransportFactory;
use super::settings::{KafkaSettings, TransportSettings};
use super::topology;
use super::{
    Disposition, EndpointSet, PublishTransport, ReceiveContext, ReceiveEndpoint,
    ReceiveEndpointConfig, ReceivePipeline, Result, SendTransport, TransportError, TransportHost,
};
use crate::message::{Headers, TransportMessage};
use crate::resilience::{wrap_publish, wrap_send, ResiliencePipeline, TransportResilienceOptions};
use crate::utils::retry::connection_backoff;

/// Schemes served by the Kafka transport.
pub const SCHEMES: &[&str] = &["kafka"];

/// Redeliveries of one offset before it is moved to the dead-letter topic.
const MAX_REDELIVERIES: u32 = 10;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn failure(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::TransportFailure(format!("{context}: {e}"))
}

fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}-dlq")
}

/// Client settings shared by producers and consumers.
fn client_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &settings.bootstrap_servers);
    if let Some(client_id) = &settings.client_id {
        config.set("client.id", client_id);
    }
    if let Some(protocol) = &settings.security_protocol {
        config.set("security.protocol", protocol);
    }
    if let Some(mechanism) = &settings.sasl_mechanism {
        config.set("sasl.mechanism", mechanism);
    }
    if let Some(username) = &settings.sasl_username {
        config.set("sasl.username", username);
    }
    if let Some(password) = &settings.sasl_password {
        config.set("sasl.password", password);
    }
    config
}

fn producer_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = client_config(settings);
    config.set("message.timeout.ms", settings.producer_timeout_ms.to_string());
    config.set("acks", "all");
    config.set("enable.idempotence", "true");
    config
}

fn consumer_config(settings: &KafkaSettings, group_id: &str) -> ClientConfig {
    let mut config = client_config(settings);
    config.set("group.id", group_id);
    config.set("enable.auto.commit", "false");
    config.set("auto.offset.reset", "earliest");
    config
}

// ============================================================================
// Wire format
// ============================================================================

fn record_headers(message: &TransportMessage) -> OwnedHeaders {
    message
        .wire_headers()
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Partition key: keeps a conversation on one partition, in order.
fn record_key(message: &TransportMessage) -> Option<String> {
    message
        .correlation_id()
        .or(message.conversation_id())
        .or(message.message_id())
        .map(|id| id.to_string())
}

fn to_transport_message(record: &BorrowedMessage<'_>) -> TransportMessage {
    let mut wire = Headers::new();
    if let Some(headers) = record.headers() {
        for header in headers.iter() {
            let value = header.value.and_then(|v| std::str::from_utf8(v).ok());
            if let Some(value) = value {
                wire.insert(header.key, value);
            }
        }
    }
    TransportMessage::from_wire(record.payload().unwrap_or_default().to_vec(), wire)
}

/// Producer plus topic naming shared by a host's transports.
struct Producer {
    producer: FutureProducer,
    topic_prefix: Option<String>,
    timeout: Duration,
}

impl Producer {
    async fn produce(&self, topic: &str, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let key = record_key(message);
        let mut record = FutureRecord::to(topic)
            .payload(message.body().as_ref())
            .headers(record_headers(message));
        if let Some(key) = &key {
            record = record.key(key.as_str());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            delivered = self.producer.send(record, self.timeout) => {
                let (partition, offset) = delivered
                    .map_err(|(e, _)| failure(&format!("Failed to produce to '{topic}'"), e))?;
                debug!(topic = %topic, partition, offset, key = ?key, "Produced message to Kafka");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Host
// ============================================================================

/// Kafka transport host.
pub struct KafkaTransportHost {
    address: Url,
    settings: KafkaSettings,
    producer: Arc<Producer>,
    resilience: Option<TransportResilienceOptions>,
    pipeline: ResiliencePipeline,
    endpoints: EndpointSet,
}

impl KafkaTransportHost {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let address = Url::parse(&settings.address).map_err(|e| {
            TransportError::Configuration(format!("invalid kafka address '{}': {e}", settings.address))
        })?;
        let producer: FutureProducer = producer_config(settings)
            .create()
            .map_err(|e| TransportError::Configuration(format!("Failed to create Kafka producer: {e}")))?;

        info!(
            address = %address,
            bootstrap_servers = %settings.bootstrap_servers,
            "Kafka transport host initialized"
        );

        Ok(Self {
            address,
            producer: Arc::new(Producer {
                producer,
                topic_prefix: settings.topic_prefix.clone(),
                timeout: Duration::from_millis(settings.producer_timeout_ms),
            }),
            pipeline: ResiliencePipeline::new(settings.resilience.as_ref()),
            resilience: settings.resilience.clone(),
            settings: settings.clone(),
            endpoints: EndpointSet::new(),
        })
    }

    fn publish_topic(&self, message_type: &str) -> String {
        topology::topic_name(message_type, self.producer.topic_prefix.as_deref())
    }
}

#[async_trait]
impl TransportHost for KafkaTransportHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(address = %self.address, endpoints = self.endpoints.len(), "Starting Kafka transport host");
        self.endpoints.start_all(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        info!(address = %self.address, "Stopping Kafka transport host");
        let stopped = self.endpoints.stop_all().await;
        let producer = self.producer.clone();
        // Flush blocks on librdkafka.
        let flushed = tokio::task::spawn_blocking(move || {
            rdkafka::producer::Producer::flush(&producer.producer, Duration::from_secs(5))
        })
        .await;
        if let Ok(Err(e)) = flushed {
            warn!(address = %self.address, error = %e, "Kafka producer flush failed");
        }
        stopped
    }

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(KafkaTopicTransport {
            producer: self.producer.clone(),
            topic: topology::queue_name(address)?,
        });
        Ok(wrap_send(transport, &self.pipeline))
    }

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>> {
        let transport = Arc::new(KafkaTopicTransport {
            producer: self.producer.clone(),
            topic: self.publish_topic(message_type),
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

        let topic = topology::queue_name(&config.input_address)?;
        let pipeline = ReceivePipeline::build(self, &config, self.resilience.as_ref()).await?;
        let mut topics = vec![topic.clone()];
        topics.extend(config.subscriptions.iter().map(|t| self.publish_topic(t)));

        let endpoint = Arc::new(KafkaReceiveEndpoint {
            consumer: Arc::new(TopicConsumer {
                input_address: config.input_address.clone(),
                source_address: self.address.clone(),
                group_id: format!("{}.{}", self.settings.group_id, topic),
                topic,
                topics,
                settings: self.settings.clone(),
                producer: self.producer.clone(),
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

struct KafkaTopicTransport {
    producer: Arc<Producer>,
    topic: String,
}

#[async_trait]
impl SendTransport for KafkaTopicTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.producer.produce(&self.topic, message, cancel).await
    }
}

#[async_trait]
impl PublishTransport for KafkaTopicTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.producer.produce(&self.topic, message, cancel).await
    }
}

// ============================================================================
// Receive endpoint
// ============================================================================

struct KafkaReceiveEndpoint {
    consumer: Arc<TopicConsumer>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl KafkaReceiveEndpoint {
    fn running(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReceiveEndpoint for KafkaReceiveEndpoint {
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
                "Kafka consumer for '{}' panicked: {e}",
                self.consumer.topic
            ))
        })?;
        info!(topic = %self.consumer.topic, "Kafka consumer stopped");
        Ok(())
    }
}

struct TopicConsumer {
    input_address: Url,
    source_address: Url,
    topic: String,
    topics: Vec<String>,
    group_id: String,
    settings: KafkaSettings,
    producer: Arc<Producer>,
    pipeline: Arc<ReceivePipeline>,
}

impl TopicConsumer {
    fn subscribe(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = consumer_config(&self.settings, &self.group_id)
            .create()
            .map_err(|e| failure("Failed to create Kafka consumer", e))?;
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| failure("Failed to subscribe to topics", e))?;
        info!(group_id = %self.group_id, topics = ?self.topics, "Subscribed to Kafka topics");
        Ok(consumer)
    }

    async fn consume_with_reconnect(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = connection_backoff().build();
        let mut redeliveries: HashMap<(String, i32, i64), u32> = HashMap::new();

        while !cancel.is_cancelled() {
            match self.subscribe() {
                Ok(consumer) => {
                    backoff = connection_backoff().build();
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = consumer.recv() => next,
                        };
                        match next {
                            Ok(record) => {
                                self.process(&consumer, &record, &mut redeliveries, &cancel)
                                    .await
                            }
                            Err(e) => {
                                error!(group_id = %self.group_id, error = %e, "Kafka consumer error, will reconnect");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(group_id = %self.group_id, error = %e, "Failed to set up consumer, retrying after backoff");
                }
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(5));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn process(
        &self,
        consumer: &StreamConsumer,
        record: &BorrowedMessage<'_>,
        redeliveries: &mut HashMap<(String, i32, i64), u32>,
        cancel: &CancellationToken,
    ) {
        let message = to_transport_message(record);
        debug!(
            topic = %record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            "Received Kafka message"
        );
        let context = Arc::new(ReceiveContext::new(
            message.clone(),
            Some(self.source_address.clone()),
            self.input_address.clone(),
            cancel.child_token(),
        ));
        let mut disposition = self.pipeline.process(context).await;

        let position = (record.topic().to_string(), record.partition(), record.offset());
        if disposition == Disposition::Requeue {
            let count = redeliveries.entry(position.clone()).or_default();
            *count += 1;
            if *count < MAX_REDELIVERIES {
                if let Err(e) = consumer.seek(
                    record.topic(),
                    record.partition(),
                    Offset::Offset(record.offset()),
                    SEEK_TIMEOUT,
                ) {
                    error!(topic = %record.topic(), error = %e, "Failed to seek back for redelivery");
                }
                return;
            }
            warn!(
                topic = %record.topic(),
                offset = record.offset(),
                deliveries = *count,
                "Delivery limit reached, moving message to dead-letter topic"
            );
            disposition = Disposition::TransportDeadLetter;
        }
        redeliveries.remove(&position);

        if disposition == Disposition::TransportDeadLetter {
            let copy = dead_letter_copy(&message, "DeliveryFailed", "message handling failed");
            let topic = dead_letter_topic(record.topic());
            // Must land even while shutting down.
            if let Err(e) = self.producer.produce(&topic, &copy, &CancellationToken::new()).await {
                error!(topic = %topic, error = %e, "Dead-letter produce failed, message will be redelivered");
                return;
            }
        }

        if let Err(e) = consumer.commit_message(record, CommitMode::Async) {
            error!(topic = %record.topic(), error = %e, "Failed to commit offset");
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`KafkaTransportHost`]s for `kafka://`.
pub struct KafkaTransportFactory;

#[async_trait]
impl TransportFactory for KafkaTransportFactory {
    fn name(&self) -> &str {
        "Kafka"
    }

    fn supported_schemes(&self) -> &[&'static str] {
        SCHEMES
    }

    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>> {
        match settings {
            TransportSettings::Kafka(settings) => Ok(Arc::new(KafkaTransportHost::new(settings)?)),
            other => Err(TransportError::Configuration(format!(
                "kafka transport cannot use '{}' settings",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let settings = KafkaSettings {
            security_protocol: Some("SASL_SSL".to_string()),
            sasl_username: Some("user".to_string()),
            ..Default::default()
        };
        let config = consumer_config(&settings, "courier.orders");

        assert_eq!(config.get("group.id"), Some("courier.orders"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("sasl.password"), None);
    }

    #[test]
    fn test_producer_config_is_idempotent() {
        let config = producer_config(&KafkaSettings::default());
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("message.timeout.ms"), Some("5000"));
    }

    #[test]
    fn test_record_key_prefers_correlation() {
        let correlation = Uuid::now_v7();
        let message = TransportMessage::builder(Vec::new())
            .message_id(Uuid::now_v7())
            .correlation_id(Some(correlation))
            .build();
        assert_eq!(record_key(&message), Some(correlation.to_string()));
        assert_eq!(record_key(&TransportMessage::builder(Vec::new()).build()), None);
    }

    #[test]
    fn test_record_headers_carry_envelope() {
        let message = TransportMessage::builder(Vec::new())
            .message_type("orders.order-placed")
            .header("Tenant", "acme")
            .build();
        let headers = record_headers(&message);
        let keys: Vec<&str> = headers.iter().map(|h| h.key).collect();
        assert!(keys.contains(&"Tenant"));
        assert!(keys.contains(&crate::message::headers::MESSAGE_TYPE));
    }

    #[test]
    fn test_dead_letter_topic_name() {
        assert_eq!(dead_letter_topic("orders"), "orders-dlq");
    }
}
