//! gRPC transport.
//!
//! Direct process-to-process delivery without a broker. Every host holds a
//! lazily connected channel to the peer at its address; a host configured
//! with `listen` also serves the `courier.transport.Transport` service for
//! the endpoints connected to it.
//!
//! - `Send` targets the endpoint named by the destination's first path
//!   segment.
//! - `Publish` fans out to every local endpoint subscribed to the message
//!   type.
//!
//! There is no broker to redeliver, so a delivery that ends in
//! [`Disposition::Requeue`] or [`Disposition::TransportDeadLetter`] fails
//! the call and the caller's retry (or outbox) delivers again.

mod proto;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::registry::TransportFactory;
use super::settings::{GrpcSettings, TransportSettings};
use super::topology;
use super::{
    Disposition, EndpointSet, PublishTransport, ReceiveContext, ReceiveEndpoint,
    ReceiveEndpointConfig, ReceivePipeline, Result, SendTransport, TransportError, TransportHost,
};
use crate::message::TransportMessage;
use crate::resilience::{wrap_publish, wrap_send, ResiliencePipeline, TransportResilienceOptions};

pub use proto::{
    PublishRequest, PublishResponse, SendRequest, SendResponse, TransportClient, TransportServer,
    TransportService, WireMessage, SERVICE_NAME,
};

/// Schemes served by the gRPC transport.
pub const SCHEMES: &[&str] = &["grpc"];

/// Port used when the address names none.
pub const DEFAULT_PORT: u16 = 50051;

/// Map a call's status onto the transport error taxonomy.
pub fn status_error(status: Status) -> TransportError {
    let detail = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::InvalidArgument | Code::NotFound | Code::Unimplemented => {
            TransportError::Configuration(detail)
        }
        Code::Cancelled => TransportError::Cancelled,
        Code::DeadlineExceeded => TransportError::Timeout(detail),
        Code::Aborted => TransportError::HandlerFailure(detail),
        _ => TransportError::TransportFailure(detail),
    }
}

/// Reject messages no consumer could route, and give every accepted message
/// a correlation id.
fn inbound_message(wire: Option<WireMessage>) -> std::result::Result<TransportMessage, Status> {
    let mut wire = wire.ok_or_else(|| Status::invalid_argument("message is required"))?;
    if wire.body.is_empty() {
        return Err(Status::invalid_argument("message body is required"));
    }
    if is_blank(&wire.message_type) {
        return Err(Status::invalid_argument("message type is required"));
    }
    if is_blank(&wire.content_type) {
        return Err(Status::invalid_argument("content type is required"));
    }
    if is_blank(&wire.correlation_id) {
        wire.correlation_id = Some(Uuid::now_v7().to_string());
    }
    TransportMessage::try_from(wire)
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, |value| value.trim().is_empty())
}

// ============================================================================
// Server side
// ============================================================================

/// Endpoints served by one listening host, keyed by queue name.
#[derive(Default)]
struct Inbound {
    endpoints: DashMap<String, Arc<GrpcReceiveEndpoint>>,
}

#[async_trait]
impl TransportService for Inbound {
    async fn send(&self, request: SendRequest) -> std::result::Result<SendResponse, Status> {
        if request.destination.trim().is_empty() {
            return Err(Status::invalid_argument("destination is required"));
        }
        let destination = Url::parse(&request.destination).map_err(|e| {
            Status::invalid_argument(format!("invalid destination '{}': {e}", request.destination))
        })?;
        let queue = topology::queue_name(&destination)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let message = inbound_message(request.message)?;

        let endpoint = self
            .endpoints
            .get(&queue)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Status::not_found(format!("no endpoint for queue '{queue}'")))?;
        endpoint.deliver(message).await?;
        Ok(SendResponse {})
    }

    async fn publish(&self, request: PublishRequest) -> std::result::Result<PublishResponse, Status> {
        let message = inbound_message(request.message)?;
        let message_type = message.message_type().unwrap_or_default().to_string();

        let subscribers: Vec<Arc<GrpcReceiveEndpoint>> = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().subscribes_to(&message_type))
            .map(|entry| entry.value().clone())
            .collect();
        let results = join_all(subscribers.iter().map(|endpoint| endpoint.deliver(message.clone()))).await;

        let delivered = results.iter().filter(|result| result.is_ok()).count() as u32;
        if let Some(Err(status)) = results.into_iter().find(|result| result.is_err()) {
            return Err(status);
        }
        debug!(message_type = %message_type, delivered, "Published message to gRPC subscribers");
        Ok(PublishResponse { delivered })
    }
}

struct Listener {
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

struct Serving {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

// ============================================================================
// Host
// ============================================================================

/// gRPC transport host.
pub struct GrpcTransportHost {
    address: Url,
    client: TransportClient,
    listener: Option<Listener>,
    inbound: Arc<Inbound>,
    serving: Mutex<Option<Serving>>,
    max_message_size: usize,
    resilience: Option<TransportResilienceOptions>,
    pipeline: ResiliencePipeline,
    endpoints: EndpointSet,
}

impl GrpcTransportHost {
    /// Build a host, binding its listener when `listen` is set.
    pub async fn bind(settings: &GrpcSettings) -> Result<Self> {
        let mut address = Url::parse(&settings.address).map_err(|e| {
            TransportError::Configuration(format!("invalid gRPC address '{}': {e}", settings.address))
        })?;

        let listener = match &settings.listen {
            Some(listen) => {
                let socket = TcpListener::bind(listen.as_str()).await.map_err(|e| {
                    TransportError::Configuration(format!("cannot listen on '{listen}': {e}"))
                })?;
                let local_addr = socket.local_addr().map_err(|e| {
                    TransportError::TransportFailure(format!("listener on '{listen}' has no address: {e}"))
                })?;
                if address.port() == Some(0) {
                    address.set_port(Some(local_addr.port())).map_err(|_| {
                        TransportError::Configuration(format!("gRPC address '{address}' cannot carry a port"))
                    })?;
                }
                Some(Listener {
                    socket: Mutex::new(Some(socket)),
                    local_addr,
                })
            }
            None => None,
        };

        let client = TransportClient::new(connect_lazy(&address, settings)?, settings.max_message_size);

        info!(
            address = %address,
            listen = ?listener.as_ref().map(|l| l.local_addr),
            "gRPC transport host initialized"
        );

        Ok(Self {
            address,
            client,
            listener,
            inbound: Arc::new(Inbound::default()),
            serving: Mutex::new(None),
            max_message_size: settings.max_message_size,
            pipeline: ResiliencePipeline::new(settings.resilience.as_ref()),
            resilience: settings.resilience.clone(),
            endpoints: EndpointSet::new(),
        })
    }

    /// Address the listener is bound to, when this host serves.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr)
    }

    fn serving(&self) -> std::sync::MutexGuard<'_, Option<Serving>> {
        self.serving.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        if self.serving().is_some() {
            return Ok(());
        }

        let taken = listener
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        // A stopped host binds its address again.
        let socket = match taken {
            Some(socket) => socket,
            None => TcpListener::bind(listener.local_addr).await.map_err(|e| {
                TransportError::TransportFailure(format!("cannot listen on '{}': {e}", listener.local_addr))
            })?,
        };

        let service = TransportServer::new(self.inbound.clone(), self.max_message_size);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let token = cancel.child_token();
        let local_addr = listener.local_addr;
        let handle = tokio::spawn(async move {
            let signal = async move {
                tokio::select! {
                    _ = shutdown_rx => {}
                    _ = token.cancelled() => {}
                }
            };
            if let Err(e) = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(socket), signal)
                .await
            {
                error!(listen = %local_addr, error = %e, "gRPC transport server failed");
            }
        });

        *self.serving() = Some(Serving { shutdown, handle });
        info!(listen = %local_addr, "gRPC transport server listening");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(serving) = self.serving().take() else {
            return Ok(());
        };
        let _ = serving.shutdown.send(());
        serving.handle.await.map_err(|e| {
            TransportError::TransportFailure(format!("gRPC transport server panicked: {e}"))
        })
    }
}

fn connect_lazy(address: &Url, settings: &GrpcSettings) -> Result<tonic::transport::Channel> {
    let host = address.host_str().ok_or_else(|| {
        TransportError::Configuration(format!("gRPC address '{address}' has no host"))
    })?;
    let uri = format!("http://{}:{}", host, address.port().unwrap_or(DEFAULT_PORT));

    let mut endpoint = Endpoint::from_shared(uri.clone())
        .map_err(|e| TransportError::Configuration(format!("invalid gRPC endpoint '{uri}': {e}")))?
        .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
        .timeout(Duration::from_millis(settings.request_timeout_ms));
    if settings.keep_alive_ms > 0 {
        endpoint = endpoint
            .http2_keep_alive_interval(Duration::from_millis(settings.keep_alive_ms))
            .keep_alive_while_idle(true);
    }
    Ok(endpoint.connect_lazy())
}

#[async_trait]
impl TransportHost for GrpcTransportHost {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(address = %self.address, endpoints = self.endpoints.len(), "Starting gRPC transport host");
        self.endpoints.start_all(cancel).await?;
        self.serve(cancel).await
    }

    async fn stop(&self) -> Result<()> {
        info!(address = %self.address, "Stopping gRPC transport host");
        let served = self.shutdown().await;
        self.endpoints.stop_all().await?;
        served
    }

    async fn get_send_transport(&self, address: &Url) -> Result<Arc<dyn SendTransport>> {
        topology::queue_name(address)?;
        let transport = Arc::new(GrpcSendTransport {
            client: self.client.clone(),
            destination: address.to_string(),
        });
        Ok(wrap_send(transport, &self.pipeline))
    }

    async fn get_publish_transport(&self, message_type: &str) -> Result<Arc<dyn PublishTransport>> {
        let transport = Arc::new(GrpcPublishTransport {
            client: self.client.clone(),
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
        if self.listener.is_none() {
            return Err(TransportError::Configuration(format!(
                "gRPC host '{}' does not listen; set `listen` to receive on '{}'",
                self.address, config.input_address
            )));
        }

        let queue = topology::queue_name(&config.input_address)?;
        let pipeline = ReceivePipeline::build(self, &config, self.resilience.as_ref()).await?;
        let endpoint = Arc::new(GrpcReceiveEndpoint {
            input_address: config.input_address.clone(),
            source_address: self.address.clone(),
            queue: queue.clone(),
            subscriptions: config.subscriptions.clone(),
            pipeline,
            running: Mutex::new(None),
            in_flight: RwLock::new(()),
        });
        let attached = self.endpoints.attach(endpoint.clone()).await?;
        self.inbound.endpoints.entry(queue).or_insert(endpoint);
        Ok(attached)
    }
}

// ============================================================================
// Send / publish
// ============================================================================

struct GrpcSendTransport {
    client: TransportClient,
    destination: String,
}

#[async_trait]
impl SendTransport for GrpcSendTransport {
    async fn send(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let request = SendRequest {
            destination: self.destination.clone(),
            message: Some(WireMessage::from(message)),
        };
        let mut client = self.client.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            reply = client.send(request) => {
                reply.map_err(status_error)?;
                debug!(destination = %self.destination, message_id = ?message.message_id(), "Sent message over gRPC");
                Ok(())
            }
        }
    }
}

struct GrpcPublishTransport {
    client: TransportClient,
    message_type: String,
}

#[async_trait]
impl PublishTransport for GrpcPublishTransport {
    async fn publish(&self, message: &TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let mut wire = WireMessage::from(message);
        wire.message_type.get_or_insert_with(|| self.message_type.clone());
        let request = PublishRequest { message: Some(wire) };
        let mut client = self.client.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            reply = client.publish(request) => {
                let delivered = reply.map_err(status_error)?.into_inner().delivered;
                debug!(message_type = %self.message_type, delivered, "Published message over gRPC");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Receive endpoint
// ============================================================================

struct GrpcReceiveEndpoint {
    input_address: Url,
    source_address: Url,
    queue: String,
    subscriptions: Vec<String>,
    pipeline: ReceivePipeline,
    running: Mutex<Option<CancellationToken>>,
    /// Held shared by each delivery; `stop` takes it exclusively to wait
    /// for in-flight handlers.
    in_flight: RwLock<()>,
}

impl GrpcReceiveEndpoint {
    fn running(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribes_to(&self, message_type: &str) -> bool {
        self.subscriptions.iter().any(|s| s == message_type)
    }

    async fn deliver(&self, message: TransportMessage) -> std::result::Result<(), Status> {
        let _in_flight = self.in_flight.read().await;
        let Some(cancel) = self.running().clone() else {
            return Err(Status::unavailable(format!("endpoint '{}' is not running", self.queue)));
        };

        let context = Arc::new(ReceiveContext::new(
            message,
            Some(self.source_address.clone()),
            self.input_address.clone(),
            cancel.child_token(),
        ));
        match self.pipeline.process(context).await {
            Disposition::Acknowledge | Disposition::DeadLettered => Ok(()),
            Disposition::Requeue => {
                warn!(queue = %self.queue, "gRPC delivery failed, caller will retry");
                Err(Status::unavailable(format!("handling on '{}' failed", self.queue)))
            }
            Disposition::TransportDeadLetter => {
                warn!(queue = %self.queue, "gRPC delivery rejected, no dead-letter address configured");
                Err(Status::aborted(format!(
                    "handling on '{}' failed and the message was not dead-lettered",
                    self.queue
                )))
            }
        }
    }
}

#[async_trait]
impl ReceiveEndpoint for GrpcReceiveEndpoint {
    fn input_address(&self) -> &Url {
        &self.input_address
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running();
        if running.is_none() {
            *running = Some(cancel.child_token());
            info!(queue = %self.queue, "gRPC endpoint started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(token) = self.running().take() else {
            return Ok(());
        };
        token.cancel();
        let _drained = self.in_flight.write().await;
        info!(queue = %self.queue, "gRPC endpoint stopped");
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`GrpcTransportHost`]s for `grpc://`.
pub struct GrpcTransportFactory;

#[async_trait]
impl TransportFactory for GrpcTransportFactory {
    fn name(&self) -> &str {
        "gRPC"
    }

    fn supported_schemes(&self) -> &[&'static str] {
        SCHEMES
    }

    async fn create_host(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHost>> {
        match settings {
            TransportSettings::Grpc(settings) => Ok(Arc::new(GrpcTransportHost::bind(settings).await?)),
            other => Err(TransportError::Configuration(format!(
                "gRPC transport cannot use '{}' settings",
                other.kind()
            ))),
        }
    }
}
