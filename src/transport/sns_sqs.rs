//! AWS SNS/SQS transport.
//!
//! - send: SQS queue named by the address's first path segment
//! - publish: SNS topic per message type, `{topic_prefix}-{message-type}`
//! - receive: SQS queue subscribed (raw delivery) to the topics of every
//!   subscribed message type
//!
//! Bodies are base64 encoded; SQS only carries text. Envelope headers
//! travel as one JSON message attribute since SQS allows at most ten.
//! With `max_receive_count` set, each queue gets a `{queue}-dlq` redrive
//! target, which also receives transport dead letters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use backon::BackoffBuilder;
use base64::prelude::*;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::receive::dead_letter_copy;
use super::registry::TransportFactory;
use super::settings::{SnsSqsSettings, TransportSettings};
use super::topology;
use super::{
    Disposition, EndpointSet, PublishTransport, ReceiveContext, ReceiveEndpoint,
    ReceiveEndpointConfig, ReceivePipeline, Result, SendTransport, TransportError, TransportHost,
};
use crate::message::{Headers, TransportMessage};
use crate::resilience::{wrap_publish, wrap_send, ResiliencePipeline, TransportResilienceOptions};
use crate::utils::retry::connection_backoff;

/// Schemes served by the SNS/SQS transport.
pub const SCHEMES: &[&str] = &["aws", "sqs", "sns"];

/// Message attribute holding the envelope headers as a JSON object.
const HEADERS_ATTR: &str = "CourierHeaders";

fn failure(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::TransportFailure(format!("{context}: {e}"))
}

fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}-dlq")
}

// ============================================================================
// Wire format
// ============================================================================

fn encode_headers(message: &TransportMessage) -> Result<String> {
    let wire = message.wire_headers();
    let map: HashMap<&str, &str> = wire.iter().collect();
    serde_json::to_string(&map).map_err(|e| failure("Failed to encode headers", e))
}

fn decode_message(body: &str, headers_json: Option<&str>) -> Result<TransportMessage> {
    let payload = BASE64_STANDARD
        .decode(body)
        .map_err(|e| failure("Failed to decode message body", e))?;
    let mut wire = Headers::new();
    if let Some(raw) = headers_json {
        let map: HashMap<String, String> =
            serde_json::from_str(raw).map_err(|e| failure("Failed to decode headers", e))?;
        for (key, value) in map {
            wire.insert(key, value);
        }
    }
    Ok(TransportMessage::from_wire(payload, wire))
}

/// SQS queue policy letting the given SNS topics deliver to the queue.
fn topic_delivery_policy(queue_arn: &str, topic_arns: &[String]) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "sns.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": { "ArnEquals": { "aws:SourceArn": topic_arns } }
        }]
    })
    .to_string()
}

fn redrive_policy(dead_letter_arn: &str, max_receive_count: u32) -> String {
    serde_json::json!({
        "deadLetterTargetArn": dead_letter_arn,
        "maxReceiveCount": max_receive_count.to_string(),
    })
    .to_string()
}

// ============================================================================
// Clients
// ============================================================================

/// SNS and SQS clients plus caches of resolved queue URLs and topic ARNs.
struct Clients {
    sns: SnsClient,
    sqs: SqsClient,
    topic_prefix: Option<String>,
    visibility_timeout_secs: i32,
    max_receive_count: u32,
    queue_urls: RwLock<HashMap<String, String>>,
    topic_arns: RwLock<HashMap<String, String>>,
}

impl Clients {
    fn topic_for(&self, message_type: &str) -> String {
        topology::topic_name(message_type, self.topic_prefix.as_deref())
    }

    /// Queue URL, creating the queue when missing. Creation is idempotent.
    async fn queue_url(&self, queue: &str) -> Result<String> {
        if let Some(url) = self.queue_urls.read().await.get(queue) {
            return Ok(url.clone());
        }

        let result = self
            .sqs
            .create_queue()
            .queue_name(queue)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                self.visibility_timeout_secs.to_string(),
            )
            .send()
            .await
            .map_err(|e| failure(&format!("Failed to create SQS queue '{queue}'"), e))?;
        let url = result
            .queue_url()
            .ok_or_else(|| failure("SQS create_queue returned no URL", queue))?
            .to_string();

        self.queue_urls
            .write()
            .await
            .insert(queue.to_string(), url.clone());
        info!(queue = %queue, url = %url, "Created/found SQS queue");
        Ok(url)
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String> {
        let attributes = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| failure("Failed to get queue ARN", e))?;
        attributes
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| failure("Queue has no ARN attribute", queue_url))
    }

    async fn topic_arn(&self, topic: &str) -> Result<String> {
        if let Some(arn) = self.topic_arns.read().await.get(topic) {
            return Ok(arn.clone());
        }

        let result = self
            .sns
            .create_topic()
            .name(topic)
            .send()
            .await
            .map_err(|e| failure(&format!("Failed to create SNS topic '{topic}'"), e))?;
        let arn = result
            .topic_arn()
            .ok_or_else(|| failure("SNS create_topic returned no ARN", topic))?
            .to_string();

        self.topic_arns
            .write()
            .await
            .insert(topic.to_string(), arn.clone());
        info!(topic = %topic, arn = %arn, "Created/found SNS topic");
        Ok(arn)
    }

    async fn send(&self, queue: &str, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let queue_url = self.queue_url(queue).await?;
        let attribute = aws_sdk_sqs::types::MessageAttributeValue::builder()
            .data_type("String")
            .string_value(encode_headers(message)?)
            .build()
            .map_err(|e| failure("Failed to build attribute", e))?;

        let request = self
            .sqs
            .send_message()
            .queue_url(&queue_url)
            .message_body(BASE64_STANDARD.encode(message.body()))
            .message_attributes(HEADERS_ATTR, attribute)
            .send();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            sent = request => {
                sent.map_err(|e| failure(&format!("Failed to send to SQS queue '{queue}'"), e))?;
                debug!(queue = %queue, message_id = ?message.message_id(), "Sent message to SQS");
                Ok(())
            }
        }
    }

    async fn publish(&self, topic: &str, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let topic_arn = self.topic_arn(topic).await?;
        let attribute = aws_sdk_sns::types::MessageAttributeValue::builder()
            .data_type("String")
            .string_value(encode_headers(message)?)
            .build()
            .map_err(|e| failure("Failed to build attribute", e))?;

        let request = self
            .sns
            .publish()
            .topic_arn(&topic_arn)
            .message(BASE64_STANDARD.encode(message.body()))
            .message_attributes(HEADERS_ATTR, attribute)
            .send();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            published = request => {
                published.map_err(|e| failure(&format!("Failed to publish to SNS topic '{topic}'"), e))?;
                debug!(topic = %topic, message_id = ?message.message_id(), "Published message to SNS");
                Ok(())
            }
        }
    }

    /// Create the endpoint queue, its redrive target and topic subscriptions.
    async fn provision_endpoint(&self, queue: &str, message_types: &[String]) -> Result<String> {
        let queue_url = self.queue_url(queue).await?;
        let queue_arn = self.queue_arn(&queue_url).await?;

        if self.max_receive_count > 0 {
            let dead_letter_url = self.queue_url(&dead_letter_queue(queue)).await?;
            let dead_letter_arn = self.queue_arn(&dead_letter_url).await?;
            self.sqs
                .set_queue_attributes()
                .queue_url(&queue_url)
                .attributes(
                    QueueAttributeName::RedrivePolicy,
                    redrive_policy(&dead_letter_arn, self.max_receive_count),
                )
                .send()
                .await
                .map_err(|e| failure("Failed to set redrive policy", e))?;
        }

        if message_types.is_empty() {
            return Ok(queue_url);
        }

        let mut topic_arns = Vec::with_capacity(message_types.len());
        for message_type in message_types {
            topic_arns.push(self.topic_arn(&self.topic_for(message_type)).await?);
        }
        self.sqs
            .set_queue_attributes()
            .queue_url(&queue_url)
            .attributes(
                QueueAttributeName::Policy,
                topic_delivery_policy(&queue_arn, &topic_arns),
            )
            .send()
            .await
            .map_err(|e| failure("Failed to set queue policy", e))?;

        for topic_arn in &topic_arns {
            self.sns
                .subscribe()
                .topic_arn(topic_arn)
                .protocol("sqs")
                .endpoint(&queue_arn)
                .attributes("RawMessageDelivery", "true")
                .send()
                .await
                .map_err(|e| failure("Failed to subscribe queue to topic", e))?;
            debug!(queue_arn = %queue_arn, topic_arn = %topic_arn, "Subscribed queue to topic");
        }
        Ok(queue_url)
    }
}

// ============================================================================
// Host
// ============================================================================

/// AWS SNS/SQS transport host.
pub struct SnsSqsTransportHost {
    address: Url,
    settings: SnsSqsSettings,
    clients: Arc<Clients>,
    resilience: Option<TransportResilienceOptions>,
    pipeline: ResiliencePipeline,
    endpoints: EndpointSet,
}

impl SnsSqsTransportHost {
    /// Load AWS configuration and build the clients.
    pub async fn connect(settings: &SnsSqsSettings) -> Result<Self> {
        let address = Url::parse(&settings.address).map_err(|e| {
            TransportError::Configuration(format!("invalid aws address '{}': {e}", settings.address))
        })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        info!(
            address = %address,
            region = ?settings.region,
            endpoint = ?settings.endpoint_url,
            "SNS/SQS transport host initialized"
        );

        Ok(Self {
            address,
            clients: Arc::new(Clients {
                sns: SnsClient::new(&aws_config),
                sqs: SqsClient::new(&aws_config),
                topic_prefix: settings.topic_prefix.clone(),
                visibility_timeout_secs: settings.visibility_timeout_secs,
                max_receive_count: settings.max_receive_count,
                queue_urls: RwLock::new(HashMap::new()),
                topic_arns: RwLock::new(HashMap::new()),
            }),
            pipeline: ResiliencePipeline::new(settings.resilience.as_ref()),
            resilience: settings.resilience.clone(),
            settings: settings.clone(),
            endpoints: EndpointSet::new(),
        })
    }
}

#[async_trait]
impl TransportHost for SnsSqsTransportHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(address = %self.address, endpoints = self.endpoints.len(), "Starting SNS/SQS transport host");
        self.endpoints.start_all(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        info!(address = %self.address, "Stopping SNS/SQS transport host");
        self.endpoints.stop_all().await
    }

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(SqsSendTransport {
            clients: self.clients.clone(),
            queue: topology::queue_name(address)?,
        });
        Ok(wrap_send(transport, &self.pipeline))
    }

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>> {
        let transport = Arc::new(SnsPublishTransport {
            topic: self.clients.topic_for(message_type),
            clients: self.clients.clone(),
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

        let endpoint = Arc::new(SqsReceiveEndpoint {
            poller: Arc::new(QueuePoller {
                input_address: config.input_address.clone(),
                source_address: self.address.clone(),
                queue,
                subscriptions: config.subscriptions.clone(),
                max_messages: self.settings.max_messages.clamp(1, 10),
                wait_time_secs: self.settings.wait_time_secs.clamp(0, 20),
                clients: self.clients.clone(),
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

struct SqsSendTransport {
    clients: Arc<Clients>,
    queue: String,
}

#[async_trait]
impl SendTransport for SqsSendTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.clients.send(&self.queue, message, cancel).await
    }
}

struct SnsPublishTransport {
    clients: Arc<Clients>,
    topic: String,
}

#[async_trait]
impl PublishTransport for SnsPublishTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.clients.publish(&self.topic, message, cancel).await
    }
}

// ============================================================================
// Receive endpoint
// ============================================================================

struct SqsReceiveEndpoint {
    poller: Arc<QueuePoller>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SqsReceiveEndpoint {
    fn running(&self) -> std::sync::MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReceiveEndpoint for SqsReceiveEndpoint {
    fn input_address(&self) -> &Url {
        &self.poller.input_address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        let token = cancel.child_token();
        let handle = tokio::spawn(self.poller.clone().poll_with_reconnect(token.clone()));
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
                "SQS poller for '{}' panicked: {e}",
                self.poller.queue
            ))
        })?;
        info!(queue = %self.poller.queue, "SQS poller stopped");
        Ok(())
    }
}

struct QueuePoller {
    input_address: Url,
    source_address: Url,
    queue: String,
    subscriptions: Vec<String>,
    max_messages: i32,
    wait_time_secs: i32,
    clients: Arc<Clients>,
    pipeline: Arc<ReceivePipeline>,
}

impl QueuePoller {
    async fn poll_with_reconnect(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = connection_backoff().build();

        while !cancel.is_cancelled() {
            match self
                .clients
                .provision_endpoint(&self.queue, &self.subscriptions)
                .await
            {
                Ok(queue_url) => {
                    info!(queue = %self.queue, "Starting SQS poller");
                    backoff = connection_backoff().build();
                    if self.poll(&queue_url, &cancel).await.is_none() {
                        return;
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to provision queue, retrying after backoff");
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

    /// Poll until cancelled (`None`) or a receive fails (`Some`).
    async fn poll(&self, queue_url: &str, cancel: &CancellationToken) -> Option<()> {
        loop {
            let request = self
                .clients
                .sqs
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(self.max_messages)
                .wait_time_seconds(self.wait_time_secs)
                .message_attribute_names("All")
                .send();
            let output = tokio::select! {
                _ = cancel.cancelled() => return None,
                output = request => output,
            };

            match output {
                Ok(output) => {
                    for message in output.messages() {
                        self.process(queue_url, message, cancel).await;
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "SQS receive failed");
                    return Some(());
                }
            }
        }
    }

    async fn process(&self, queue_url: &str, raw: &aws_sdk_sqs::types::Message, cancel: &CancellationToken) {
        let Some(receipt) = raw.receipt_handle() else {
            return;
        };
        let headers_json = raw
            .message_attributes()
            .and_then(|attrs| attrs.get(HEADERS_ATTR))
            .and_then(|value| value.string_value());

        let message = match decode_message(raw.body().unwrap_or_default(), headers_json) {
            Ok(message) => message,
            Err(e) => {
                // Undecodable, redelivery cannot help.
                error!(queue = %self.queue, error = %e, "Failed to decode SQS message");
                self.dead_letter_raw(queue_url, raw, receipt).await;
                return;
            }
        };

        let context = Arc::new(ReceiveContext::new(
            message.clone(),
            Some(self.source_address.clone()),
            self.input_address.clone(),
            cancel.child_token(),
        ));
        let disposition = self.pipeline.process(context).await;

        let settled = match disposition {
            Disposition::Acknowledge | Disposition::DeadLettered => self.delete(queue_url, receipt).await,
            Disposition::TransportDeadLetter => {
                let copy = dead_letter_copy(&message, "HandlerFailure", "message handling failed");
                let dead_letter = dead_letter_queue(&self.queue);
                match self.clients.send(&dead_letter, &copy, &CancellationToken::new()).await {
                    Ok(()) => self.delete(queue_url, receipt).await,
                    Err(e) => Err(e),
                }
            }
            Disposition::Requeue => self
                .clients
                .sqs
                .change_message_visibility()
                .queue_url(queue_url)
                .receipt_handle(receipt)
                .visibility_timeout(0)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| failure("Failed to release message", e)),
        };
        if let Err(e) = settled {
            warn!(queue = %self.queue, error = %e, ?disposition, "Failed to settle SQS message, it will reappear after the visibility timeout");
        }
    }

    async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()> {
        self.clients
            .sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| failure("Failed to delete message", e))
    }

    async fn dead_letter_raw(&self, queue_url: &str, raw: &aws_sdk_sqs::types::Message, receipt: &str) {
        let dead_letter = match self.clients.queue_url(&dead_letter_queue(&self.queue)).await {
            Ok(url) => url,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Dead-letter queue unavailable");
                return;
            }
        };
        let forwarded = self
            .clients
            .sqs
            .send_message()
            .queue_url(&dead_letter)
            .message_body(raw.body().unwrap_or_default())
            .set_message_attributes(raw.message_attributes().cloned())
            .send()
            .await;
        match forwarded {
            Ok(_) => {
                if let Err(e) = self.delete(queue_url, receipt).await {
                    error!(queue = %self.queue, error = %e, "Failed to delete dead-lettered message");
                }
            }
            Err(e) => error!(queue = %self.queue, error = %e, "Failed to dead-letter undecodable message"),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`SnsSqsTransportHost`]s for `aws://`, `sqs://` and `sns://`.
pub struct SnsSqsTransportFactory;

#[async_trait]
impl TransportFactory for SnsSqsTransportFactory {
    fn name(&self) -> &str {
        "AmazonSQS"
    }

    fn supported_schemes(&self) -> &[&'static str] {
        SCHEMES
    }

    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>> {
        match settings {
            TransportSettings::SnsSqs(settings) => {
                Ok(Arc::new(SnsSqsTransportHost::connect(settings).await?))
            }
            other => Err(TransportError::Configuration(format!(
                "sns-sqs transport cannot use '{}' settings",
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
    fn test_body_and_headers_survive_encoding() {
        let id = Uuid::now_v7();
        let message = TransportMessage::builder(vec![0u8, 159, 146, 150])
            .content_type("application/octet-stream")
            .message_type("orders.order-placed")
            .message_id(id)
            .header("Tenant", "acme")
            .build();

        let body = BASE64_STANDARD.encode(message.body());
        let headers = encode_headers(&message).unwrap();
        let decoded = decode_message(&body, Some(&headers)).unwrap();

        assert_eq!(decoded.body().as_ref(), &[0u8, 159, 146, 150]);
        assert_eq!(decoded.message_id(), Some(id));
        assert_eq!(decoded.message_type(), Some("orders.order-placed"));
        assert_eq!(decoded.headers().get("tenant"), Some("acme"));
    }

    #[test]
    fn test_invalid_body_is_rejected() {
        assert!(decode_message("not base64!", None).is_err());
    }

    #[test]
    fn test_policies_name_their_targets() {
        let policy = topic_delivery_policy(
            "arn:aws:sqs:us-east-1:000000000000:orders",
            &["arn:aws:sns:us-east-1:000000000000:orders-order-placed".to_string()],
        );
        assert!(policy.contains("sns.amazonaws.com"));
        assert!(policy.contains("orders-order-placed"));

        let redrive = redrive_policy("arn:aws:sqs:us-east-1:000000000000:orders-dlq", 5);
        let parsed: serde_json::Value = serde_json::from_str(&redrive).unwrap();
        assert_eq!(parsed["maxReceiveCount"], "5");
    }
}
