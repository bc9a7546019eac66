//! Host settings per backend.
//!
//! Settings are plain serde structs and always compiled; the matching host
//! needs its cargo feature (`channel`, `amqp`, `kafka`, `sns-sqs`, `grpc`).

use serde::Deserialize;
use url::Url;

use crate::resilience::TransportResilienceOptions;

use super::{Result, TransportError};

/// Settings for one transport host, tagged by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportSettings {
    Channel(ChannelSettings),
    Amqp(AmqpSettings),
    Kafka(KafkaSettings),
    SnsSqs(SnsSqsSettings),
    Grpc(GrpcSettings),
}

impl TransportSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportSettings::Channel(_) => "channel",
            TransportSettings::Amqp(_) => "amqp",
            TransportSettings::Kafka(_) => "kafka",
            TransportSettings::SnsSqs(_) => "sns-sqs",
            TransportSettings::Grpc(_) => "grpc",
        }
    }

    /// Base address the host is registered under.
    pub fn address(&self) -> Result<Url> {
        let raw = match self {
            TransportSettings::Channel(s) => &s.address,
            TransportSettings::Amqp(s) => &s.address,
            TransportSettings::Kafka(s) => &s.address,
            TransportSettings::SnsSqs(s) => &s.address,
            TransportSettings::Grpc(s) => &s.address,
        };
        Url::parse(raw).map_err(|e| {
            TransportError::Configuration(format!("invalid {} address '{raw}': {e}", self.kind()))
        })
    }

    /// Host-level resilience defaults.
    pub fn resilience(&self) -> Option<&TransportResilienceOptions> {
        match self {
            TransportSettings::Channel(s) => s.resilience.as_ref(),
            TransportSettings::Amqp(s) => s.resilience.as_ref(),
            TransportSettings::Kafka(s) => s.resilience.as_ref(),
            TransportSettings::SnsSqs(s) => s.resilience.as_ref(),
            TransportSettings::Grpc(s) => s.resilience.as_ref(),
        }
    }
}

/// In-memory transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Base address; its scheme selects this host.
    pub address: String,
    /// Buffered messages per endpoint before senders wait.
    pub capacity: usize,
    /// Deliveries of a requeued message before it is moved to the
    /// `{queue}-dlq` queue.
    pub max_deliveries: u32,
    pub resilience: Option<TransportResilienceOptions>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            address: "channel://local".to_string(),
            capacity: 1024,
            max_deliveries: 10,
            resilience: None,
        }
    }
}

/// RabbitMQ transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// Base address, e.g. `amqp://broker`; its scheme selects this host.
    pub address: String,
    /// Broker connection URL.
    pub url: String,
    /// Unacknowledged deliveries per consumer.
    pub prefetch_count: u16,
    /// Prefix for per-message-type fanout exchanges.
    pub exchange_prefix: Option<String>,
    /// Declared as the queue's `x-dead-letter-exchange`; enables native dead-lettering.
    pub dead_letter_exchange: Option<String>,
    pub resilience: Option<TransportResilienceOptions>,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            address: "amqp://localhost".to_string(),
            url: "amqp://localhost:5672/%2f".to_string(),
            prefetch_count: 10,
            exchange_prefix: None,
            dead_letter_exchange: None,
            resilience: None,
        }
    }
}

/// Kafka transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub address: String,
    /// Comma-separated broker list.
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: Option<String>,
    pub topic_prefix: Option<String>,
    /// `plaintext`, `ssl`, `sasl_plaintext` or `sasl_ssl`.
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub producer_timeout_ms: u64,
    pub resilience: Option<TransportResilienceOptions>,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            address: "kafka://localhost".to_string(),
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "courier".to_string(),
            client_id: None,
            topic_prefix: None,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            producer_timeout_ms: 5_000,
            resilience: None,
        }
    }
}

/// AWS SNS/SQS transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnsSqsSettings {
    /// `sqs://`, `sns://` or `aws://` base address.
    pub address: String,
    pub region: Option<String>,
    /// Endpoint override (LocalStack).
    pub endpoint_url: Option<String>,
    pub topic_prefix: Option<String>,
    /// Long-poll wait per receive call, 0 to 20 seconds.
    pub wait_time_secs: i32,
    /// Messages per receive call, 1 to 10.
    pub max_messages: i32,
    pub visibility_timeout_secs: i32,
    /// Receives before SQS moves a message to the `-dlq` queue. Zero
    /// disables the redrive policy.
    pub max_receive_count: u32,
    pub resilience: Option<TransportResilienceOptions>,
}

impl Default for SnsSqsSettings {
    fn default() -> Self {
        Self {
            address: "sqs://local".to_string(),
            region: None,
            endpoint_url: None,
            topic_prefix: None,
            wait_time_secs: 10,
            max_messages: 10,
            visibility_timeout_secs: 30,
            max_receive_count: 5,
            resilience: None,
        }
    }
}

/// Point-to-point gRPC transport between courier processes.
///
/// Every host is a client of the peer at `address`. A host with `listen`
/// set also serves the endpoints connected to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    /// `grpc://host:port` of the peer serving the endpoints. With `listen`
    /// set, a port of 0 takes the port the listener was bound to.
    pub address: String,
    /// Socket address to serve on, e.g. `0.0.0.0:50051`.
    pub listen: Option<String>,
    pub connect_timeout_ms: u64,
    /// Deadline per send or publish call.
    pub request_timeout_ms: u64,
    /// Largest encoded message accepted or sent, in bytes.
    pub max_message_size: usize,
    /// HTTP/2 keep-alive ping interval. Zero disables pings.
    pub keep_alive_ms: u64,
    pub resilience: Option<TransportResilienceOptions>,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            address: "grpc://localhost:50051".to_string(),
            listen: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_message_size: 4 * 1024 * 1024,
            keep_alive_ms: 30_000,
            resilience: None,
        }
    }
}
