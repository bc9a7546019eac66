//! In-memory stores for tests, development and single-process setups.
//!
//! Each store keeps its rows in a sharded concurrent map, so operations on
//! different keys do not wait on one another.

mod inbox;
mod outbox;
mod saga;
mod scheduled;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

pub use inbox::InMemoryInboxStore;
pub use outbox::InMemoryOutboxStore;
pub use saga::InMemorySagaRepository;
pub use scheduled::InMemoryScheduledMessageStore;

use super::{
    InboxState, InboxStore, OutboxMessage, Result, StorageError, StorageSession,
    StorageSessionFactory,
};

/// Sessions over a shared in-memory inbox and outbox.
#[derive(Clone)]
pub struct InMemorySessionFactory {
    inbox: Arc<InMemoryInboxStore>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemorySessionFactory {
    pub fn new(inbox: Arc<InMemoryInboxStore>, outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self { inbox, outbox }
    }
}

#[async_trait]
impl StorageSessionFactory for InMemorySessionFactory {
    async fn begin(&self) -> Result<Box<dyn StorageSession>> {
        Ok(Box::new(InMemoryStorageSession {
            inbox: self.inbox.clone(),
            outbox: self.outbox.clone(),
            inbox_adds: Vec::new(),
            processed: Vec::new(),
            outbox_adds: Vec::new(),
        }))
    }
}

/// Buffers writes until commit.
pub struct InMemoryStorageSession {
    inbox: Arc<InMemoryInboxStore>,
    outbox: Arc<InMemoryOutboxStore>,
    inbox_adds: Vec<InboxState>,
    processed: Vec<(Uuid, String, DateTime<Utc>)>,
    outbox_adds: Vec<OutboxMessage>,
}

#[async_trait]
impl StorageSession for InMemoryStorageSession {
    async fn try_add_inbox(&mut self, state: &InboxState) -> Result<bool> {
        let staged = self.inbox_adds.iter().any(|s| s.key() == state.key());
        if staged || self.inbox.contains(state.message_id, &state.consumer_id) {
            return Ok(false);
        }
        self.inbox_adds.push(state.clone());
        Ok(true)
    }

    async fn mark_inbox_processed(
        &mut self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()> {
        self.processed
            .push((message_id, consumer_id.to_string(), processed_time));
        Ok(())
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        let staged = self
            .outbox_adds
            .iter()
            .any(|m| m.message_id == message.message_id);
        if staged || self.outbox.contains(message.message_id) {
            return Err(outbox::duplicate(message.message_id));
        }
        self.outbox_adds.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let session = *self;
        let inbox_keys: Vec<_> = session.inbox_adds.iter().map(InboxState::key).collect();
        // A concurrent session may have claimed the same inbox key or outbox
        // id since it was staged here; that fails the whole commit.
        session
            .inbox
            .insert_all(session.inbox_adds)
            .map_err(|(message_id, consumer_id)| {
                StorageError::DuplicateKey(format!("inbox ({message_id}, {consumer_id})"))
            })?;
        let staged = session.outbox_adds.len();
        if let Err(message_id) = session.outbox.insert_all(session.outbox_adds) {
            session.inbox.remove_all(&inbox_keys);
            return Err(outbox::duplicate(message_id));
        }
        for (message_id, consumer_id, time) in session.processed {
            session
                .inbox
                .mark_processed(message_id, &consumer_id, time)
                .await?;
        }
        debug!(outbox = staged, "In-memory session committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(
            discarded = self.outbox_adds.len() + self.inbox_adds.len(),
            "In-memory session rolled back"
        );
        Ok(())
    }
}
