//! Transport contracts.
//!
//! Every backend provides a [`TransportHost`] that owns its physical
//! connection and hands out:
//! - [`SendTransport`]: point-to-point delivery to an address
//! - [`PublishTransport`]: fan-out by message type
//! - [`ReceiveEndpoint`]: a consumer bound to an input address
//!
//! Hosts are selected per destination scheme through
//! [`registry::TransportHostProvider`].

mod endpoints;
pub mod settings;
pub mod topology;
pub mod receive;
pub mod registry;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
#[cfg(feature = "grpc")]
pub mod grpc;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "sns-sqs")]
pub mod sns_sqs;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::message::{SerializerError, TransportMessage};
use crate::resilience::TransportResilienceOptions;

pub use endpoints::{address_key, EndpointSet};
pub use receive::{Disposition, ReceivePipeline};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Unresolvable scheme, address or settings. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection, send or publish failure.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Consumer logic failed.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializerError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::TransportFailure(_)
                | TransportError::HandlerFailure(_)
                | TransportError::Timeout(_)
        )
    }
}

// ============================================================================
// Send / publish
// ============================================================================

/// Point-to-point delivery to one address.
#[async_trait]
pub trait SendTransport: Send + Sync {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()>;
}

/// Fan-out delivery keyed by message type.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()>;
}

// ============================================================================
// Receive
// ============================================================================

/// An inbound message together with where it came from.
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    message: TransportMessage,
    source_address: Option<Url>,
    input_address: Url,
    cancel: CancellationToken,
}

impl ReceiveContext {
    pub fn new(
        message: TransportMessage,
        source_address: Option<Url>,
        input_address: Url,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            message,
            source_address,
            input_address,
            cancel,
        }
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// Address of the host that delivered the message, when known.
    pub fn source_address(&self) -> Option<&Url> {
        self.source_address.as_ref()
    }

    pub fn input_address(&self) -> &Url {
        &self.input_address
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Handler invoked for every message arriving at an endpoint.
pub trait ReceiveHandler: Send + Sync {
    fn handle(&self, context: Arc<ReceiveContext>) -> BoxFuture<'static, Result<()>>;
}

struct FnHandler<F>(F);

impl<F, Fut> ReceiveHandler for FnHandler<F>
where
    F: Fn(Arc<ReceiveContext>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, context: Arc<ReceiveContext>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(context))
    }
}

/// Adapt a closure into a shared [`ReceiveHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ReceiveHandler>
where
    F: Fn(Arc<ReceiveContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Failure handling for one receive endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReceiveEndpointFaultSettings {
    /// Overrides the host's resilience defaults for this endpoint.
    pub resilience: Option<TransportResilienceOptions>,
    /// Explicit dead-letter destination, tried first.
    pub dead_letter_address: Option<Url>,
    /// Fall back to the broker's own dead-lettering.
    pub use_transport_dead_letter: bool,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

/// What a host needs to connect a receive endpoint.
#[derive(Clone)]
pub struct ReceiveEndpointConfig {
    pub input_address: Url,
    pub handler: Arc<dyn ReceiveHandler>,
    pub fault_settings: Option<ReceiveEndpointFaultSettings>,
    /// Published message types this endpoint should also receive.
    pub subscriptions: Vec<String>,
}

impl ReceiveEndpointConfig {
    pub fn new(input_address: Url, handler: Arc<dyn ReceiveHandler>) -> Self {
        Self {
            input_address,
            handler,
            fault_settings: None,
            subscriptions: Vec::new(),
        }
    }

    /// Receive published messages of `message_type` on this endpoint.
    pub fn subscribe(mut self, message_type: impl Into<String>) -> Self {
        let message_type = message_type.into();
        if !self.subscriptions.contains(&message_type) {
            self.subscriptions.push(message_type);
        }
        self
    }

    pub fn with_fault_settings(mut self, settings: ReceiveEndpointFaultSettings) -> Self {
        self.fault_settings = Some(settings);
        self
    }
}

impl fmt::Debug for ReceiveEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveEndpointConfig")
            .field("input_address", &self.input_address.as_str())
            .field("fault_settings", &self.fault_settings)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

/// A consumer bound to one input address.
#[async_trait]
pub trait ReceiveEndpoint: Send + Sync {
    fn input_address(&self) -> &Url;

    /// Begin consuming. Starting a running endpoint is a no-op.
    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    /// Stop consuming and wait for in-flight handling to finish.
    async fn stop(&self) -> Result<()>;
}

// ============================================================================
// Host
// ============================================================================

/// Owns one backend connection.
#[async_trait]
pub trait TransportHost: Send + Sync {
    /// Base address identifying this host (scheme and authority).
    fn address(&self) -> &Url;

    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    /// Stop every connected endpoint in connection order, then release the
    /// connection.
    async fn stop(&self) -> Result<()>;

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>>;

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>>;

    /// Connect a receive endpoint. Connecting an already-known input address
    /// returns the existing endpoint.
    async fn connect_receive_endpoint(
        &self,
        config: ReceiveEndpointConfig,
    ) -> Result<Arc<dyn ReceiveEndpoint>>;
}
