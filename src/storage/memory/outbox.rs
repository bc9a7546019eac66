//! In-memory OutboxStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::storage::{OutboxMessage, OutboxStore, Result, StorageError};

/// Outbox rows keyed by message id.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    messages: DashMap<Uuid, OutboxMessage>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, message_id: Uuid) -> bool {
        self.messages.contains_key(&message_id)
    }

    /// Insert every row or none. Returns the first id already present.
    pub(crate) fn insert_all(&self, messages: Vec<OutboxMessage>) -> std::result::Result<(), Uuid> {
        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let id = message.message_id;
            match self.messages.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(message);
                    inserted.push(id);
                }
                Entry::Occupied(_) => {
                    self.remove_all(&inserted);
                    return Err(id);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn remove_all(&self, message_ids: &[Uuid]) {
        for id in message_ids {
            self.messages.remove(id);
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub(crate) fn duplicate(message_id: Uuid) -> StorageError {
    StorageError::DuplicateKey(format!("outbox {message_id}"))
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, message: &OutboxMessage) -> Result<()> {
        match self.messages.entry(message.message_id) {
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                Ok(())
            }
            Entry::Occupied(_) => Err(duplicate(message.message_id)),
        }
    }

    async fn get_pending(&self, max_count: usize) -> Result<Vec<OutboxMessage>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut pending: Vec<OutboxMessage> = self
            .messages
            .iter()
            .filter(|entry| !entry.is_sent())
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|message| (message.enqueued_time, message.message_id));
        pending.truncate(max_count);
        Ok(pending)
    }

    async fn mark_sent(&self, message_id: Uuid, sent_time: DateTime<Utc>) -> Result<()> {
        if let Some(mut message) = self.messages.get_mut(&message_id) {
            message.sent_time.get_or_insert(sent_time);
        }
        Ok(())
    }
}
