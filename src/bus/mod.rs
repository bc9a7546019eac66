//! The bus facade.
//!
//! [`Bus`] ties the pieces together:
//! - typed send, publish and scheduling over the transport hosts
//! - receive endpoints routing by `MessageType` to consumers and sagas
//! - the transactional outbox, either staged explicitly or used for every
//!   send and publish
//! - request/response through [`RequestClient`]
//! - the outbox and scheduled dispatchers, started and stopped with the bus

mod consumer;
mod outbox;
mod request;
mod scope;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::addressing::AddressResolver;
use crate::dispatch::{
    Delivery, DispatchError, DispatcherHandle, InMemoryMessageScheduler, MessageScheduler,
    OutboxDispatchOptions, OutboxDispatcher, PersistedMessageScheduler, ScheduledDispatchOptions,
    ScheduledMessageDispatcher, ScheduledMessageHandle,
};
use crate::message::{
    encode_message, JsonSerializer, Message, MessageSerializer, SerializerError, TransportMessage,
    TransportMessageBuilder,
};
use crate::saga::{SagaData, SagaDefinition, SagaError, SagaOrchestrator, SagaRegistry};
use crate::storage::{
    OutboxMessage, OutboxStore, SagaRepository, ScheduledMessageStore, StorageError,
};
use crate::transport::registry::TransportHostProvider;
use crate::transport::{ReceiveEndpointConfig, ReceiveEndpointFaultSettings, TransportError};

pub use consumer::{
    admit, consumer_fn, ConsumeContext, Consumer, ConsumerRegistry, InboxConsumer, InboxOutcome,
};
pub use outbox::StagedMessage;
pub use request::{RequestClient, DEFAULT_REQUEST_TIMEOUT};
pub use scope::{MessageScopeProvider, NoopScopeProvider, ScopeKind, TracingScopeProvider};

use consumer::EndpointRouter;
use request::PendingRequests;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializerError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No response address on {0} message")]
    NoResponseAddress(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    /// Raised by consumers to reject a message.
    #[error("Consumer failed: {0}")]
    Consumer(String),
}

impl From<BusError> for TransportError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Transport(e) => e,
            BusError::Saga(e) => e.into(),
            BusError::Serialization(e) => TransportError::Serialization(e),
            BusError::Cancelled => TransportError::Cancelled,
            BusError::Timeout(after) => {
                TransportError::Timeout(format!("request timed out after {after:?}"))
            }
            other => TransportError::HandlerFailure(other.to_string()),
        }
    }
}

// ============================================================================
// Core
// ============================================================================

/// State shared by the bus, its consume contexts and request clients.
pub(crate) struct BusCore {
    address: Url,
    delivery: Delivery,
    serializer: Arc<dyn MessageSerializer>,
    scope: Arc<dyn MessageScopeProvider>,
    outbox: Option<Arc<dyn OutboxStore>>,
    route_through_outbox: bool,
    requests: PendingRequests,
    response_address: OnceCell<Url>,
}

impl BusCore {
    /// Serialize `message` into a builder carrying the standard headers.
    fn envelope<M: Message>(
        &self,
        message: &M,
        correlation_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> Result<TransportMessageBuilder> {
        let body = encode_message(self.serializer.as_ref(), message)?;
        Ok(TransportMessage::builder(body)
            .content_type(self.serializer.content_type())
            .message_type(M::MESSAGE_TYPE)
            .message_id(Uuid::now_v7())
            .correlation_id(correlation_id)
            .conversation_id(conversation_id)
            .sent_time(Utc::now()))
    }

    async fn send_transport(
        &self,
        destination: &Url,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = self.scope.scope(ScopeKind::Send, &message, Some(destination));
        async {
            if self.route_through_outbox {
                self.enqueue(&message, Some(destination.clone()), cancel).await
            } else {
                self.delivery.send(destination, &message, cancel).await?;
                Ok(())
            }
        }
        .instrument(span)
        .await
    }

    async fn publish_transport(&self, message: TransportMessage, cancel: &CancellationToken) -> Result<()> {
        let span = self.scope.scope(ScopeKind::Publish, &message, None);
        async {
            if self.route_through_outbox {
                self.enqueue(&message, None, cancel).await
            } else {
                self.delivery.publish(Some(&self.address), &message, cancel).await?;
                Ok(())
            }
        }
        .instrument(span)
        .await
    }

    async fn enqueue(
        &self,
        message: &TransportMessage,
        destination: Option<Url>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let outbox = self
            .outbox
            .as_ref()
            .ok_or_else(|| BusError::Configuration("outbox routing requires an outbox store".to_string()))?;
        let record = OutboxMessage::from_transport(message, Some(self.address.clone()), destination);
        outbox.add(&record).await?;
        debug!(message_id = %record.message_id, "Message enqueued in outbox");
        Ok(())
    }
}

// ============================================================================
// Bus
// ============================================================================

struct Running {
    cancel: CancellationToken,
    dispatchers: Vec<DispatcherHandle>,
}

/// Sends, publishes, schedules and consumes messages.
pub struct Bus {
    core: Arc<BusCore>,
    scheduler: Arc<dyn MessageScheduler>,
    request_resolver: Option<Arc<dyn AddressResolver>>,
    request_timeout: Duration,
    outbox_dispatcher: Option<Arc<OutboxDispatcher>>,
    scheduled_dispatcher: Option<Arc<ScheduledMessageDispatcher>>,
    running: Mutex<Option<Running>>,
}

impl Bus {
    pub fn builder(address: Url, hosts: Arc<TransportHostProvider>) -> BusBuilder {
        BusBuilder::new(address, hosts)
    }

    /// Address this bus publishes from and receives responses under.
    pub fn address(&self) -> &Url {
        &self.core.address
    }

    pub fn hosts(&self) -> &Arc<TransportHostProvider> {
        self.core.delivery.hosts()
    }

    pub fn scheduler(&self) -> &Arc<dyn MessageScheduler> {
        &self.scheduler
    }

    /// Start every host, which starts their endpoints, then the dispatchers.
    /// Starting a running bus does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        for host in self.hosts().hosts() {
            host.start(&cancel).await?;
        }

        let mut dispatchers = Vec::new();
        if let Some(dispatcher) = &self.outbox_dispatcher {
            dispatchers.push(dispatcher.clone().spawn(cancel.child_token()));
        }
        if let Some(dispatcher) = &self.scheduled_dispatcher {
            dispatchers.push(dispatcher.clone().spawn(cancel.child_token()));
        }

        info!(address = %self.core.address, dispatchers = dispatchers.len(), "Bus started");
        *running = Some(Running { cancel, dispatchers });
        Ok(())
    }

    /// Stop and await the dispatchers, then stop every host. All hosts are
    /// attempted; the first error is returned.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { cancel, dispatchers }) = self.running.lock().await.take() else {
            return Ok(());
        };

        for dispatcher in dispatchers {
            dispatcher.stop().await;
        }
        cancel.cancel();

        let mut first_error = None;
        for host in self.hosts().hosts() {
            if let Err(e) = host.stop().await {
                warn!(address = %host.address(), error = %e, "Host failed to stop");
                first_error.get_or_insert(e);
            }
        }
        info!(address = %self.core.address, "Bus stopped");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Send `message` to `destination`.
    pub async fn send<M: Message>(&self, destination: &Url, message: &M, cancel: &CancellationToken) -> Result<()> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        self.core.send_transport(destination, outgoing, cancel).await
    }

    /// Publish `message` to every subscriber of its type.
    pub async fn publish<M: Message>(&self, message: &M, cancel: &CancellationToken) -> Result<()> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        self.core.publish_transport(outgoing, cancel).await
    }

    /// Send a prebuilt message.
    pub async fn send_message(
        &self,
        destination: &Url,
        message: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.core.send_transport(destination, message, cancel).await
    }

    /// Publish a prebuilt message. It must carry a message type.
    pub async fn publish_message(&self, message: TransportMessage, cancel: &CancellationToken) -> Result<()> {
        self.core.publish_transport(message, cancel).await
    }

    pub async fn schedule_send<M: Message>(
        &self,
        destination: &Url,
        message: &M,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        Ok(self
            .scheduler
            .schedule_send(destination, outgoing, scheduled_time)
            .await?)
    }

    pub async fn schedule_send_after<M: Message>(
        &self,
        destination: &Url,
        message: &M,
        delay: Duration,
    ) -> Result<ScheduledMessageHandle> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        Ok(self
            .scheduler
            .schedule_send_after(destination, outgoing, delay)
            .await?)
    }

    pub async fn schedule_publish<M: Message>(
        &self,
        message: &M,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        Ok(self.scheduler.schedule_publish(outgoing, scheduled_time).await?)
    }

    pub async fn schedule_publish_after<M: Message>(
        &self,
        message: &M,
        delay: Duration,
    ) -> Result<ScheduledMessageHandle> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        Ok(self.scheduler.schedule_publish_after(outgoing, delay).await?)
    }

    /// Request client for `destination` with the bus default timeout.
    pub fn request_client<Req: Message>(&self, destination: Url) -> RequestClient<Req> {
        RequestClient::new(self.core.clone(), destination, self.request_timeout)
    }

    /// Request client whose destination comes from the request address
    /// resolver.
    pub fn resolve_request_client<Req: Message>(&self, timeout: Option<Duration>) -> Result<RequestClient<Req>> {
        let resolver = self.request_resolver.as_ref().ok_or_else(|| {
            BusError::Configuration("request address resolver is not configured".to_string())
        })?;
        let destination = resolver.resolve(Req::MESSAGE_TYPE).ok_or_else(|| {
            BusError::Configuration(format!("no request address for '{}'", Req::MESSAGE_TYPE))
        })?;
        Ok(RequestClient::new(
            self.core.clone(),
            destination,
            timeout.unwrap_or(self.request_timeout),
        ))
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.core.requests.len()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Consumers, sagas and fault policy for one input address.
pub struct EndpointBuilder {
    input_address: Url,
    consumers: ConsumerRegistry,
    sagas: SagaRegistry,
    fault_settings: Option<ReceiveEndpointFaultSettings>,
    errors: Vec<String>,
}

impl EndpointBuilder {
    fn new(input_address: Url) -> Self {
        Self {
            input_address,
            consumers: ConsumerRegistry::new(),
            sagas: SagaRegistry::new(),
            fault_settings: None,
            errors: Vec::new(),
        }
    }

    pub fn consumer<M, C>(&mut self, consumer: C) -> &mut Self
    where
        M: Message,
        C: Consumer<M> + 'static,
    {
        self.consumers.add::<M, C>(consumer);
        self
    }

    /// Run a saga on this endpoint. Requires a saga repository on the bus.
    pub fn saga<S: SagaData>(&mut self, definition: SagaDefinition<S>) -> &mut Self {
        if let Err(e) = self.sagas.register(definition) {
            self.errors.push(e.to_string());
        }
        self
    }

    pub fn fault_settings(&mut self, settings: ReceiveEndpointFaultSettings) -> &mut Self {
        self.fault_settings = Some(settings);
        self
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut types = self.consumers.message_types();
        types.extend(self.sagas.message_types());
        types.sort();
        types.dedup();
        types
    }
}

/// Assembles a [`Bus`].
pub struct BusBuilder {
    address: Url,
    hosts: Arc<TransportHostProvider>,
    serializer: Arc<dyn MessageSerializer>,
    scope: Arc<dyn MessageScopeProvider>,
    outbox: Option<(Arc<dyn OutboxStore>, OutboxDispatchOptions)>,
    route_through_outbox: bool,
    scheduled: Option<(Arc<dyn ScheduledMessageStore>, ScheduledDispatchOptions)>,
    saga_repository: Option<Arc<dyn SagaRepository>>,
    request_resolver: Option<Arc<dyn AddressResolver>>,
    request_timeout: Duration,
    endpoints: Vec<EndpointBuilder>,
}

impl BusBuilder {
    fn new(address: Url, hosts: Arc<TransportHostProvider>) -> Self {
        Self {
            address,
            hosts,
            serializer: Arc::new(JsonSerializer),
            scope: Arc::new(TracingScopeProvider),
            outbox: None,
            route_through_outbox: false,
            scheduled: None,
            saga_repository: None,
            request_resolver: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            endpoints: Vec::new(),
        }
    }

    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn scope_provider(mut self, provider: Arc<dyn MessageScopeProvider>) -> Self {
        self.scope = provider;
        self
    }

    /// Outbox store for staging, drained by an outbox dispatcher while the
    /// bus runs.
    pub fn outbox(mut self, store: Arc<dyn OutboxStore>, options: OutboxDispatchOptions) -> Self {
        self.outbox = Some((store, options));
        self
    }

    /// Write every send and publish to the outbox instead of the transport.
    pub fn route_through_outbox(mut self, enabled: bool) -> Self {
        self.route_through_outbox = enabled;
        self
    }

    /// Persist scheduled messages and run a scheduled dispatcher. Without
    /// it, scheduling uses in-process timers.
    pub fn scheduled_store(
        mut self,
        store: Arc<dyn ScheduledMessageStore>,
        options: ScheduledDispatchOptions,
    ) -> Self {
        self.scheduled = Some((store, options));
        self
    }

    pub fn saga_repository(mut self, repository: Arc<dyn SagaRepository>) -> Self {
        self.saga_repository = Some(repository);
        self
    }

    pub fn request_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.request_resolver = Some(resolver);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configure the endpoint at `input_address`. Calling again for the
    /// same address extends it.
    pub fn endpoint(mut self, input_address: Url, configure: impl FnOnce(&mut EndpointBuilder)) -> Self {
        let key = crate::transport::address_key(&input_address);
        let index = self
            .endpoints
            .iter()
            .position(|endpoint| crate::transport::address_key(&endpoint.input_address) == key);
        let endpoint = match index {
            Some(index) => &mut self.endpoints[index],
            None => {
                self.endpoints.push(EndpointBuilder::new(input_address));
                let last = self.endpoints.len() - 1;
                &mut self.endpoints[last]
            }
        };
        configure(endpoint);
        self
    }

    /// Validate addresses and connect every endpoint to its host.
    pub async fn build(self) -> Result<Bus> {
        if self.route_through_outbox && self.outbox.is_none() {
            return Err(BusError::Configuration(
                "outbox routing requires an outbox store".to_string(),
            ));
        }
        self.hosts.validate(
            std::iter::once(&self.address).chain(self.endpoints.iter().map(|e| &e.input_address)),
        )?;

        let delivery = Delivery::new(self.hosts.clone()).with_publish_address(self.address.clone());
        let core = Arc::new(BusCore {
            address: self.address,
            delivery: delivery.clone(),
            serializer: self.serializer,
            scope: self.scope,
            outbox: self.outbox.as_ref().map(|(store, _)| store.clone()),
            route_through_outbox: self.route_through_outbox,
            requests: PendingRequests::default(),
            response_address: OnceCell::new(),
        });

        for endpoint in self.endpoints {
            connect_endpoint(&core, endpoint, self.saga_repository.as_ref()).await?;
        }

        let outbox_dispatcher = self.outbox.map(|(store, options)| {
            Arc::new(OutboxDispatcher::new(store, delivery.clone(), options))
        });

        let mut scheduled_dispatcher = None;
        let scheduler: Arc<dyn MessageScheduler> = match self.scheduled {
            Some((store, options)) => {
                scheduled_dispatcher = Some(Arc::new(ScheduledMessageDispatcher::new(
                    store.clone(),
                    delivery,
                    options,
                )));
                Arc::new(PersistedMessageScheduler::new(store))
            }
            None => Arc::new(InMemoryMessageScheduler::new(delivery)),
        };

        info!(address = %core.address, "Bus built");
        Ok(Bus {
            core,
            scheduler,
            request_resolver: self.request_resolver,
            request_timeout: self.request_timeout,
            outbox_dispatcher,
            scheduled_dispatcher,
            running: Mutex::new(None),
        })
    }
}

async fn connect_endpoint(
    core: &Arc<BusCore>,
    endpoint: EndpointBuilder,
    saga_repository: Option<&Arc<dyn SagaRepository>>,
) -> Result<()> {
    if let Some(error) = endpoint.errors.first() {
        return Err(BusError::Configuration(error.clone()));
    }

    let subscriptions = endpoint.subscriptions();
    let sagas = if endpoint.sagas.is_empty() {
        None
    } else {
        let repository = saga_repository.ok_or_else(|| {
            BusError::Configuration(format!(
                "endpoint '{}' runs sagas but no saga repository is configured",
                endpoint.input_address
            ))
        })?;
        Some(Arc::new(SagaOrchestrator::new(
            repository.clone(),
            Arc::new(endpoint.sagas),
        )))
    };

    let router = Arc::new(EndpointRouter {
        core: Arc::downgrade(core),
        consumers: endpoint.consumers,
        sagas,
    });

    let mut config = ReceiveEndpointConfig::new(endpoint.input_address.clone(), router);
    for message_type in subscriptions {
        config = config.subscribe(message_type);
    }
    if let Some(settings) = endpoint.fault_settings {
        config = config.with_fault_settings(settings);
    }

    let host = core.delivery.hosts().get_host(&endpoint.input_address)?;
    host.connect_receive_endpoint(config).await?;
    debug!(address = %endpoint.input_address, "Bus endpoint connected");
    Ok(())
}

#[cfg(test)]
mod tests;
