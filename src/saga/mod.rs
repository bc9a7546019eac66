//! Correlated long-running workflows.
//!
//! A [`SagaDefinition`] names the message types that start an instance, the
//! transitions applied to later messages and how a message is correlated to
//! its instance. The [`SagaOrchestrator`] loads the instance, applies the
//! transition and saves it under optimistic concurrency; outgoing messages
//! requested by a transition are returned as [`SagaEffect`]s and emitted
//! only after the save succeeds.
//!
//! [`SagaExecution`] runs multi-step work with compensations.

mod execution;
mod orchestrator;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::message::{
    decode_message, encode_message, JsonSerializer, Message, MessageSerializer, SerializerError,
    TransportMessage,
};
use crate::storage::{SagaState, StorageError};
use crate::transport::TransportError;

pub use execution::{SagaExecution, SagaExecutionReport, SagaStatus, SagaStep};
pub use orchestrator::{SagaEffectSink, SagaInstanceStatus, SagaOrchestrator, SagaOutcome};

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Errors raised while running sagas.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// The instance kept changing underneath every re-read. Retryable.
    #[error("Concurrency conflict on saga {state_type} {correlation_id}")]
    ConcurrencyConflict {
        state_type: String,
        correlation_id: Uuid,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializerError),

    /// Persisted state does not match the saga's state type.
    #[error("Invalid saga state: {0}")]
    InvalidState(#[from] serde_json::Error),

    /// A transition or step rejected the message.
    #[error("Saga handler failed: {0}")]
    Handler(String),

    #[error("Saga cancelled")]
    Cancelled,

    /// A persisted transition's outgoing message could not be emitted.
    #[error("Saga effect failed: {0}")]
    Effect(#[from] TransportError),
}

impl SagaError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::ConcurrencyConflict { .. } | SagaError::Storage(_) => true,
            SagaError::Effect(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<SagaError> for TransportError {
    fn from(error: SagaError) -> Self {
        match error {
            SagaError::Serialization(e) => TransportError::Serialization(e),
            SagaError::Cancelled => TransportError::Cancelled,
            SagaError::Effect(e) => e,
            other => TransportError::HandlerFailure(other.to_string()),
        }
    }
}

/// Saga state payloads. Blanket-implemented.
pub trait SagaData: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> SagaData for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

// ============================================================================
// Context
// ============================================================================

/// An outgoing message requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEffect {
    Send {
        destination: Url,
        message: TransportMessage,
    },
    Publish(TransportMessage),
}

/// What a transition sees: the instance state and a buffer for outgoing
/// messages.
pub struct SagaContext<S> {
    correlation_id: Uuid,
    conversation_id: Option<Uuid>,
    is_new: bool,
    completed: bool,
    state: S,
    effects: Vec<SagaEffect>,
}

impl<S> SagaContext<S> {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    /// Whether the instance was created for this message.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Finish the saga; the instance is deleted instead of saved.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Send `message` to `destination` once the instance is saved.
    pub fn send<M: Message>(&mut self, destination: Url, message: &M) -> Result<()> {
        let message = self.outgoing(message)?;
        self.effects.push(SagaEffect::Send {
            destination,
            message,
        });
        Ok(())
    }

    /// Publish `message` once the instance is saved.
    pub fn publish<M: Message>(&mut self, message: &M) -> Result<()> {
        let message = self.outgoing(message)?;
        self.effects.push(SagaEffect::Publish(message));
        Ok(())
    }

    fn outgoing<M: Message>(&self, message: &M) -> Result<TransportMessage> {
        let serializer = JsonSerializer;
        let body = encode_message(&serializer, message)?;
        Ok(TransportMessage::builder(body)
            .content_type(serializer.content_type())
            .message_type(M::MESSAGE_TYPE)
            .message_id(Uuid::now_v7())
            .correlation_id(Some(self.correlation_id))
            .conversation_id(self.conversation_id)
            .build())
    }
}

// ============================================================================
// Definition
// ============================================================================

type Transition<S> =
    Arc<dyn Fn(&mut SagaContext<S>, &TransportMessage) -> Result<()> + Send + Sync>;
type Correlator = Arc<dyn Fn(&TransportMessage) -> Option<Uuid> + Send + Sync>;

/// Declares one saga: its state, start messages, transitions and
/// correlation.
pub struct SagaDefinition<S: SagaData> {
    state_type: String,
    start_types: HashSet<String>,
    transitions: HashMap<String, Transition<S>>,
    correlate: Correlator,
    _state: PhantomData<fn() -> S>,
}

/// Correlation id of the message, else its conversation id.
pub fn default_correlation(message: &TransportMessage) -> Option<Uuid> {
    message.correlation_id().or(message.conversation_id())
}

impl<S: SagaData> SagaDefinition<S> {
    /// `state_type` keys persisted instances, so it must be stable.
    pub fn new(state_type: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            start_types: HashSet::new(),
            transitions: HashMap::new(),
            correlate: Arc::new(default_correlation),
            _state: PhantomData,
        }
    }

    /// `M` creates an instance when none exists, then applies `transition`.
    pub fn starts_with<M, F>(mut self, transition: F) -> Self
    where
        M: Message,
        F: Fn(&mut SagaContext<S>, M) -> Result<()> + Send + Sync + 'static,
    {
        self.start_types.insert(M::MESSAGE_TYPE.to_string());
        self.on::<M, F>(transition)
    }

    /// `M` is applied to an existing instance and ignored otherwise.
    pub fn on<M, F>(mut self, transition: F) -> Self
    where
        M: Message,
        F: Fn(&mut SagaContext<S>, M) -> Result<()> + Send + Sync + 'static,
    {
        let typed: Transition<S> = Arc::new(move |context, message| {
            let decoded: M = decode_message(&JsonSerializer, message.content_type(), message.body())?;
            transition(context, decoded)
        });
        self.transitions.insert(M::MESSAGE_TYPE.to_string(), typed);
        self
    }

    /// Replace the correlation function.
    pub fn correlate_by<F>(mut self, correlate: F) -> Self
    where
        F: Fn(&TransportMessage) -> Option<Uuid> + Send + Sync + 'static,
    {
        self.correlate = Arc::new(correlate);
        self
    }
}

/// Result of applying a transition, before persistence.
pub(crate) struct Applied {
    pub state: SagaState,
    pub effects: Vec<SagaEffect>,
    pub completed: bool,
    pub is_new: bool,
}

/// Type-erased saga used by the registry and orchestrator.
pub(crate) trait SagaHandler: Send + Sync {
    fn state_type(&self) -> &str;

    fn message_types(&self) -> Vec<String>;

    fn handles(&self, message_type: &str) -> bool;

    fn starts(&self, message_type: &str) -> bool;

    fn correlate(&self, message: &TransportMessage) -> Option<Uuid>;

    fn apply(
        &self,
        existing: Option<SagaState>,
        correlation_id: Uuid,
        message: &TransportMessage,
    ) -> Result<Applied>;
}

impl<S: SagaData> SagaHandler for SagaDefinition<S> {
    fn state_type(&self) -> &str {
        &self.state_type
    }

    fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.transitions.keys().cloned().collect();
        types.sort();
        types
    }

    fn handles(&self, message_type: &str) -> bool {
        self.transitions.contains_key(message_type)
    }

    fn starts(&self, message_type: &str) -> bool {
        self.start_types.contains(message_type)
    }

    fn correlate(&self, message: &TransportMessage) -> Option<Uuid> {
        (self.correlate)(message).filter(|id| !id.is_nil())
    }

    fn apply(
        &self,
        existing: Option<SagaState>,
        correlation_id: Uuid,
        message: &TransportMessage,
    ) -> Result<Applied> {
        let message_type = message.message_type().unwrap_or_default();
        let transition = self.transitions.get(message_type).ok_or_else(|| {
            SagaError::Handler(format!(
                "saga {} has no transition for '{message_type}'",
                self.state_type
            ))
        })?;

        let (state, version, conversation_id, handled_messages, is_new) = match existing {
            Some(stored) => (
                serde_json::from_value::<S>(stored.data)?,
                stored.version,
                stored.conversation_id.or(message.conversation_id()),
                stored.handled_messages,
                false,
            ),
            None => (S::default(), 0, message.conversation_id(), Vec::new(), true),
        };

        let mut context = SagaContext {
            correlation_id,
            conversation_id,
            is_new,
            completed: false,
            state,
            effects: Vec::new(),
        };
        transition(&mut context, message)?;

        Ok(Applied {
            state: SagaState {
                correlation_id,
                state_type: self.state_type.clone(),
                conversation_id: context.conversation_id,
                version,
                data: serde_json::to_value(&context.state)?,
                updated_time: Utc::now(),
                handled_messages,
            },
            effects: context.effects,
            completed: context.completed,
            is_new,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Sagas indexed by the message types they react to.
#[derive(Clone, Default)]
pub struct SagaRegistry {
    sagas: Vec<Arc<dyn SagaHandler>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a saga. A second saga with the same state type is rejected.
    pub fn register<S: SagaData>(&mut self, definition: SagaDefinition<S>) -> Result<()> {
        if self
            .sagas
            .iter()
            .any(|saga| saga.state_type() == definition.state_type)
        {
            return Err(SagaError::Handler(format!(
                "saga {} is already registered",
                definition.state_type
            )));
        }
        self.sagas.push(Arc::new(definition));
        Ok(())
    }

    pub(crate) fn handlers_for(&self, message_type: &str) -> Vec<Arc<dyn SagaHandler>> {
        self.sagas
            .iter()
            .filter(|saga| saga.handles(message_type))
            .cloned()
            .collect()
    }

    /// Whether any saga reacts to `message_type`.
    pub fn handles(&self, message_type: &str) -> bool {
        self.sagas.iter().any(|saga| saga.handles(message_type))
    }

    /// Every message type some saga reacts to, sorted and unique.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .sagas
            .iter()
            .flat_map(|saga| saga.message_types())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}

impl fmt::Debug for SagaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.sagas.iter().map(|saga| saga.state_type()).collect();
        f.debug_struct("SagaRegistry").field("sagas", &names).finish()
    }
}
