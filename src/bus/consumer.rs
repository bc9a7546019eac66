//! Typed consumers and the per-endpoint message-type router.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use url::Url;
use uuid::Uuid;

use super::scope::ScopeKind;
use super::{BusCore, BusError, Result};
use crate::message::{decode_message, headers, Headers, Message, TransportMessage};
use crate::saga::{self, SagaEffect, SagaEffectSink, SagaOrchestrator, SagaOutcome};
use crate::storage::{InboxState, InboxStore};
use crate::transport::{self, ReceiveContext, ReceiveHandler, TransportError};

/// Handles one message type.
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync {
    async fn consume(&self, context: ConsumeContext<M>) -> Result<()>;
}

struct FnConsumer<F>(F);

#[async_trait]
impl<M, F, Fut> Consumer<M> for FnConsumer<F>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn consume(&self, context: ConsumeContext<M>) -> Result<()> {
        (self.0)(context).await
    }
}

/// Adapt a closure into a [`Consumer`].
pub fn consumer_fn<M, F, Fut>(f: F) -> impl Consumer<M>
where
    M: Message,
    F: Fn(ConsumeContext<M>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    FnConsumer(f)
}

// ============================================================================
// Context
// ============================================================================

/// A decoded message plus the bus operations available while consuming it.
///
/// Messages sent or published through the context carry its correlation
/// id, and its conversation id (or, failing that, its message id).
pub struct ConsumeContext<M> {
    message: M,
    receive: Arc<ReceiveContext>,
    core: Arc<BusCore>,
}

impl<M: Message> ConsumeContext<M> {
    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn transport_message(&self) -> &TransportMessage {
        self.receive.message()
    }

    pub fn headers(&self) -> &Headers {
        self.receive.message().headers()
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.receive.message().message_id()
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.receive.message().correlation_id()
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.receive.message().conversation_id()
    }

    pub fn source_address(&self) -> Option<&Url> {
        self.receive.source_address()
    }

    pub fn input_address(&self) -> &Url {
        self.receive.input_address()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.receive.cancellation()
    }

    fn follow_up_conversation(&self) -> Option<Uuid> {
        self.conversation_id().or(self.message_id())
    }

    pub async fn send<T: Message>(&self, destination: &Url, message: &T) -> Result<()> {
        let outgoing = self
            .core
            .envelope(message, self.correlation_id(), self.follow_up_conversation())?
            .build();
        self.core
            .send_transport(destination, outgoing, self.cancellation())
            .await
    }

    pub async fn publish<T: Message>(&self, message: &T) -> Result<()> {
        let outgoing = self
            .core
            .envelope(message, self.correlation_id(), self.follow_up_conversation())?
            .build();
        self.core.publish_transport(outgoing, self.cancellation()).await
    }

    /// Reply to a request. Fails when the message carries no
    /// `ResponseAddress`.
    pub async fn respond<T: Message>(&self, response: &T) -> Result<()> {
        let incoming = self.receive.message();
        let raw = incoming
            .headers()
            .get(headers::RESPONSE_ADDRESS)
            .ok_or_else(|| BusError::NoResponseAddress(M::MESSAGE_TYPE.to_string()))?;
        let address = Url::parse(raw).map_err(|e| {
            BusError::Configuration(format!("invalid response address '{raw}': {e}"))
        })?;

        let request_id = incoming
            .headers()
            .get(headers::REQUEST_ID)
            .map(str::to_string)
            .or_else(|| incoming.message_id().map(|id| id.to_string()));

        let mut builder = self
            .core
            .envelope(response, incoming.message_id(), self.conversation_id())?;
        if let Some(request_id) = request_id {
            builder = builder.header(headers::REQUEST_ID, request_id);
        }
        self.core
            .send_transport(&address, builder.build(), self.cancellation())
            .await
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Admission decision for one (message, consumer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// First delivery, or a redelivery whose earlier attempt never finished.
    Accepted,
    /// Already processed; the consumer is skipped and the message acked.
    Duplicate,
    /// The message has no id, so it cannot be deduplicated.
    Untracked,
}

/// Record the message in the inbox unless it was already processed.
pub async fn admit(
    inbox: &dyn InboxStore,
    message_id: Option<Uuid>,
    consumer_id: &str,
) -> crate::storage::Result<InboxOutcome> {
    let Some(message_id) = message_id else {
        return Ok(InboxOutcome::Untracked);
    };
    if inbox.try_add(&InboxState::new(message_id, consumer_id)).await? {
        return Ok(InboxOutcome::Accepted);
    }
    match inbox.get(message_id, consumer_id).await? {
        Some(state) if state.processed_time.is_some() => Ok(InboxOutcome::Duplicate),
        _ => Ok(InboxOutcome::Accepted),
    }
}

/// Wraps a consumer so each message id is processed at most once per
/// consumer id.
pub struct InboxConsumer<C> {
    inbox: Arc<dyn InboxStore>,
    consumer_id: String,
    inner: C,
}

impl<C> InboxConsumer<C> {
    pub fn new(inbox: Arc<dyn InboxStore>, consumer_id: impl Into<String>, inner: C) -> Self {
        Self {
            inbox,
            consumer_id: consumer_id.into(),
            inner,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }
}

#[async_trait]
impl<M, C> Consumer<M> for InboxConsumer<C>
where
    M: Message,
    C: Consumer<M>,
{
    async fn consume(&self, context: ConsumeContext<M>) -> Result<()> {
        let message_id = context.message_id();
        match admit(self.inbox.as_ref(), message_id, &self.consumer_id).await? {
            InboxOutcome::Duplicate => {
                debug!(consumer_id = %self.consumer_id, message_id = ?message_id, "Duplicate message skipped");
                return Ok(());
            }
            InboxOutcome::Untracked => {
                warn!(consumer_id = %self.consumer_id, message_type = M::MESSAGE_TYPE, "Message has no id, processing without inbox");
            }
            InboxOutcome::Accepted => {}
        }

        self.inner.consume(context).await?;

        if let Some(message_id) = message_id {
            self.inbox
                .mark_processed(message_id, &self.consumer_id, Utc::now())
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

trait ErasedConsumer: Send + Sync {
    fn consume(&self, core: Arc<BusCore>, receive: Arc<ReceiveContext>) -> BoxFuture<'static, Result<()>>;
}

struct Typed<M, C> {
    consumer: Arc<C>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message, C: Consumer<M> + 'static> ErasedConsumer for Typed<M, C> {
    fn consume(&self, core: Arc<BusCore>, receive: Arc<ReceiveContext>) -> BoxFuture<'static, Result<()>> {
        let consumer = self.consumer.clone();
        Box::pin(async move {
            let incoming = receive.message();
            let message: M = decode_message(
                core.serializer.as_ref(),
                incoming.content_type(),
                incoming.body(),
            )?;
            let context = ConsumeContext {
                message,
                receive,
                core,
            };
            consumer.consume(context).await
        })
    }
}

/// Consumers of one endpoint keyed by message type.
#[derive(Default, Clone)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Vec<Arc<dyn ErasedConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `consumer` for `M`. Several consumers of one type run in
    /// registration order.
    pub fn add<M, C>(&mut self, consumer: C)
    where
        M: Message,
        C: Consumer<M> + 'static,
    {
        let typed: Arc<dyn ErasedConsumer> = Arc::new(Typed::<M, C> {
            consumer: Arc::new(consumer),
            _message: PhantomData,
        });
        self.consumers
            .entry(M::MESSAGE_TYPE.to_string())
            .or_default()
            .push(typed);
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.consumers.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.consumers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    fn consumers_for(&self, message_type: &str) -> Vec<Arc<dyn ErasedConsumer>> {
        self.consumers.get(message_type).cloned().unwrap_or_default()
    }
}

/// Receive handler dispatching by `MessageType` to consumers, then sagas.
///
/// Holds the bus weakly: endpoints live inside hosts the bus owns.
pub(crate) struct EndpointRouter {
    pub(crate) core: Weak<BusCore>,
    pub(crate) consumers: ConsumerRegistry,
    pub(crate) sagas: Option<Arc<SagaOrchestrator>>,
}

impl EndpointRouter {
    async fn route(
        core: Arc<BusCore>,
        consumers: Vec<Arc<dyn ErasedConsumer>>,
        sagas: Option<Arc<SagaOrchestrator>>,
        receive: Arc<ReceiveContext>,
    ) -> transport::Result<()> {
        for consumer in consumers {
            consumer
                .consume(core.clone(), receive.clone())
                .await
                .map_err(TransportError::from)?;
        }

        let Some(sagas) = sagas else {
            return Ok(());
        };
        let sink = BusEffectSink {
            core,
            cancel: receive.cancellation().clone(),
        };
        sagas.handle_with(receive.message(), &sink).await?;
        Ok(())
    }
}

/// Emits saga effects through the bus, in transition order.
struct BusEffectSink {
    core: Arc<BusCore>,
    cancel: CancellationToken,
}

#[async_trait]
impl SagaEffectSink for BusEffectSink {
    async fn emit(&self, outcome: &SagaOutcome) -> saga::Result<()> {
        for effect in &outcome.effects {
            let emitted = match effect {
                SagaEffect::Send {
                    destination,
                    message,
                } => {
                    self.core
                        .send_transport(destination, message.clone(), &self.cancel)
                        .await
                }
                SagaEffect::Publish(message) => {
                    self.core.publish_transport(message.clone(), &self.cancel).await
                }
            };
            emitted.map_err(TransportError::from)?;
        }
        Ok(())
    }
}

impl ReceiveHandler for EndpointRouter {
    fn handle(&self, receive: Arc<ReceiveContext>) -> BoxFuture<'static, transport::Result<()>> {
        let Some(core) = self.core.upgrade() else {
            return Box::pin(async { Err(TransportError::Cancelled) });
        };

        let message_type = receive.message().message_type().unwrap_or_default().to_string();
        let consumers = self.consumers.consumers_for(&message_type);
        let sagas = self
            .sagas
            .clone()
            .filter(|sagas| sagas.registry().handles(&message_type));

        if consumers.is_empty() && sagas.is_none() {
            debug!(
                address = %receive.input_address(),
                message_type = %message_type,
                "No consumer for message type, acknowledging"
            );
            return Box::pin(async { Ok(()) });
        }

        let span = core
            .scope
            .scope(ScopeKind::Consume, receive.message(), Some(receive.input_address()));
        Box::pin(Self::route(core, consumers, sagas, receive).instrument(span))
    }
}
