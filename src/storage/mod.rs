//! Reliable delivery persistence.
//!
//! Four stores back the delivery guarantees:
//! - [`OutboxStore`]: outgoing messages written with the business change
//! - [`InboxStore`]: (message, consumer) pairs for exactly-once effects
//! - [`ScheduledMessageStore`]: deferred messages awaiting their time
//! - [`SagaRepository`]: correlated workflow state with optimistic versioning
//!
//! Every store has an in-memory implementation in [`memory`]; the `sqlite`
//! feature adds relational implementations over the same contracts.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::message::{headers, Headers, TransportMessage};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{
    InMemoryInboxStore, InMemoryOutboxStore, InMemorySagaRepository,
    InMemoryScheduledMessageStore, InMemorySessionFactory,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A unique key already existed when a session committed.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "sqlite")]
    #[error("Query build error: {0}")]
    Query(#[from] sea_query::error::Error),

    #[cfg(feature = "sqlite")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

// ============================================================================
// Records
// ============================================================================

/// An outgoing message staged for delivery.
///
/// Rows without a destination are published by message type.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub message_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub source_address: Option<Url>,
    pub destination_address: Option<Url>,
    pub message_type: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub headers: Headers,
    pub enqueued_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Stage `message` for `destination`, or for publishing when `None`.
    /// A message without an id gets a fresh v7 id.
    pub fn from_transport(
        message: &TransportMessage,
        source_address: Option<Url>,
        destination_address: Option<Url>,
    ) -> Self {
        Self {
            message_id: message.message_id().unwrap_or_else(Uuid::now_v7),
            correlation_id: message.correlation_id(),
            conversation_id: message.conversation_id(),
            source_address,
            destination_address,
            message_type: message.message_type().map(str::to_string),
            content_type: message.content_type().map(str::to_string),
            body: message.body().clone(),
            headers: message.headers().clone(),
            enqueued_time: Utc::now(),
            sent_time: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent_time.is_some()
    }

    /// Rebuild the wire message, keeping the original message id.
    pub fn to_transport(&self) -> TransportMessage {
        let mut builder = TransportMessage::builder(self.body.clone())
            .headers(self.headers.clone())
            .message_id(self.message_id)
            .correlation_id(self.correlation_id)
            .conversation_id(self.conversation_id)
            .sent_time(Utc::now());
        if let Some(content_type) = &self.content_type {
            builder = builder.content_type(content_type.as_str());
        }
        if let Some(message_type) = &self.message_type {
            builder = builder.message_type(message_type.as_str());
        }
        builder.build()
    }
}

/// Receipt of one message by one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxState {
    pub message_id: Uuid,
    pub consumer_id: String,
    pub received_time: DateTime<Utc>,
    pub processed_time: Option<DateTime<Utc>>,
}

impl InboxState {
    pub fn new(message_id: Uuid, consumer_id: impl Into<String>) -> Self {
        Self {
            message_id,
            consumer_id: consumer_id.into(),
            received_time: Utc::now(),
            processed_time: None,
        }
    }

    pub fn key(&self) -> (Uuid, String) {
        (self.message_id, self.consumer_id.clone())
    }
}

/// A message waiting for its scheduled time.
///
/// The `DestinationAddress` header, when present, makes dispatch a send to
/// that address; otherwise the message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub token_id: Uuid,
    pub message_type: String,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub headers: Headers,
    pub scheduled_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub dispatched_time: Option<DateTime<Utc>>,
}

impl ScheduledMessage {
    /// Capture `message` for dispatch at `scheduled_time`. Envelope fields
    /// travel as headers so the message can be rebuilt unchanged.
    pub fn from_transport(
        token_id: Uuid,
        message: &TransportMessage,
        message_type: impl Into<String>,
        destination: Option<&Url>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let mut wire = message.wire_headers();
        wire.remove(headers::CONTENT_TYPE);
        if let Some(destination) = destination {
            wire.insert(headers::DESTINATION_ADDRESS, destination.as_str());
        }
        Self {
            token_id,
            message_type: message_type.into(),
            content_type: message.content_type().map(str::to_string),
            body: message.body().clone(),
            headers: wire,
            scheduled_time,
            created_time: Utc::now(),
            dispatched_time: None,
        }
    }

    /// Where to send the message; `None` means publish.
    pub fn destination(&self) -> Option<Url> {
        self.headers
            .get(headers::DESTINATION_ADDRESS)
            .and_then(|raw| Url::parse(raw).ok())
    }

    /// Rebuild the wire message without the routing header.
    pub fn to_transport(&self) -> TransportMessage {
        let mut wire = self.headers.clone();
        wire.remove(headers::DESTINATION_ADDRESS);
        wire.insert(headers::MESSAGE_TYPE, self.message_type.as_str());
        if let Some(content_type) = &self.content_type {
            wire.insert(headers::CONTENT_TYPE, content_type.as_str());
        }
        TransportMessage::from_wire(self.body.clone(), wire)
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_time.is_some()
    }
}

/// Persisted saga instance. `data` is the saga's own state as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaState {
    pub correlation_id: Uuid,
    pub state_type: String,
    pub conversation_id: Option<Uuid>,
    /// Optimistic concurrency token. Zero for an instance never saved.
    pub version: i64,
    pub data: serde_json::Value,
    pub updated_time: DateTime<Utc>,
    /// Ids of the most recent messages applied to this instance, oldest
    /// first. Saved with the state so a redelivered message is recognised.
    pub handled_messages: Vec<Uuid>,
}

impl SagaState {
    /// Message ids remembered per instance.
    pub const HANDLED_HISTORY: usize = 32;

    pub fn new(correlation_id: Uuid, state_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            correlation_id,
            state_type: state_type.into(),
            conversation_id: None,
            version: 0,
            data,
            updated_time: Utc::now(),
            handled_messages: Vec::new(),
        }
    }

    pub fn has_handled(&self, message_id: Uuid) -> bool {
        self.handled_messages.contains(&message_id)
    }

    /// Remember `message_id`, dropping the oldest beyond the history size.
    pub fn record_handled(&mut self, message_id: Uuid) {
        if self.has_handled(message_id) {
            return;
        }
        self.handled_messages.push(message_id);
        let excess = self
            .handled_messages
            .len()
            .saturating_sub(Self::HANDLED_HISTORY);
        self.handled_messages.drain(..excess);
    }
}

// ============================================================================
// Store contracts
// ============================================================================

/// Outgoing messages awaiting delivery.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Store a new row. An id already stored fails with
    /// [`StorageError::DuplicateKey`] and leaves the stored row untouched.
    async fn add(&self, message: &OutboxMessage) -> Result<()>;

    /// Unsent rows, oldest enqueued first, at most `max_count`.
    async fn get_pending(&self, max_count: usize) -> Result<Vec<OutboxMessage>>;

    /// Record delivery. Marking twice keeps the first time.
    async fn mark_sent(&self, message_id: Uuid, sent_time: DateTime<Utc>) -> Result<()>;
}

/// Idempotency records for consumers.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn get(&self, message_id: Uuid, consumer_id: &str) -> Result<Option<InboxState>>;

    /// Insert `state` unless its key exists. Returns `false`, leaving the
    /// stored row untouched, when it does.
    async fn try_add(&self, state: &InboxState) -> Result<bool>;

    /// Set the processed time of an existing row. Missing rows are ignored.
    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()>;
}

/// Deferred messages.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    /// Store a new row. A token already stored fails with
    /// [`StorageError::DuplicateKey`].
    async fn add(&self, message: &ScheduledMessage) -> Result<()>;

    async fn get(&self, token_id: Uuid) -> Result<Option<ScheduledMessage>>;

    /// Undispatched rows scheduled at or before `now`, earliest first.
    async fn get_due(&self, now: DateTime<Utc>, max_count: usize) -> Result<Vec<ScheduledMessage>>;

    async fn mark_dispatched(&self, token_id: Uuid, dispatched_time: DateTime<Utc>) -> Result<()>;

    /// Remove an undispatched row. Returns `false` when the token is
    /// unknown or already dispatched.
    async fn cancel(&self, token_id: Uuid) -> Result<bool>;
}

/// Saga instances keyed by correlation id and state type.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    async fn get(&self, correlation_id: Uuid, state_type: &str) -> Result<Option<SagaState>>;

    /// Persist with optimistic concurrency.
    ///
    /// A new key is inserted at version 1. An existing row is replaced only
    /// when its version equals `state.version`, after which both are
    /// incremented. On mismatch returns `false` and changes nothing,
    /// including `state`.
    async fn save(&self, state: &mut SagaState) -> Result<bool>;

    async fn delete(&self, correlation_id: Uuid, state_type: &str) -> Result<()>;

    /// Remove the row only while it is still at `version`. Returns `false`,
    /// deleting nothing, when the row changed or is gone.
    async fn delete_if_version(
        &self,
        correlation_id: Uuid,
        state_type: &str,
        version: i64,
    ) -> Result<bool>;
}

/// A unit of work over the inbox and outbox.
///
/// Writes become visible together on [`commit`](Self::commit). Dropping a
/// session without committing discards them.
#[async_trait]
pub trait StorageSession: Send {
    /// Inbox insert as part of this session. Returns `false` when the key
    /// is already stored or already staged in this session.
    async fn try_add_inbox(&mut self, state: &InboxState) -> Result<bool>;

    async fn mark_inbox_processed(
        &mut self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens [`StorageSession`]s.
#[async_trait]
pub trait StorageSessionFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageSession>>;
}

// ============================================================================
// Initialization
// ============================================================================

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// SQLite database file. Parent directories are created.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: "data/courier.db".to_string(),
        }
    }
}

/// The full set of stores for one backend.
#[derive(Clone)]
pub struct Stores {
    pub outbox: Arc<dyn OutboxStore>,
    pub inbox: Arc<dyn InboxStore>,
    pub scheduled: Arc<dyn ScheduledMessageStore>,
    pub sagas: Arc<dyn SagaRepository>,
    pub sessions: Arc<dyn StorageSessionFactory>,
}

impl Stores {
    /// Fresh in-memory stores; the session factory shares the same inbox
    /// and outbox.
    pub fn in_memory() -> Self {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let inbox = Arc::new(InMemoryInboxStore::new());
        Self {
            sessions: Arc::new(InMemorySessionFactory::new(inbox.clone(), outbox.clone())),
            outbox,
            inbox,
            scheduled: Arc::new(InMemoryScheduledMessageStore::new()),
            sagas: Arc::new(InMemorySagaRepository::new()),
        }
    }
}

/// Open the configured storage backend.
pub async fn init_storage(config: &StorageConfig) -> Result<Stores> {
    match config.kind {
        StorageKind::Memory => {
            info!("Storage: in-memory");
            Ok(Stores::in_memory())
        }
        #[cfg(feature = "sqlite")]
        StorageKind::Sqlite => {
            info!(path = %config.path, "Storage: sqlite");
            let pool = sqlite::connect(&config.path).await?;
            Ok(sqlite::stores(pool))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageKind::Sqlite => Err(StorageError::Configuration(
            "sqlite storage requires the 'sqlite' feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests;
