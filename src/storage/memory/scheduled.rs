//! In-memory ScheduledMessageStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::storage::{Result, ScheduledMessage, ScheduledMessageStore, StorageError};

/// Scheduled rows keyed by token id. Cancelled rows are removed.
#[derive(Default)]
pub struct InMemoryScheduledMessageStore {
    messages: DashMap<Uuid, ScheduledMessage>,
}

impl InMemoryScheduledMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryScheduledMessageStore {
    async fn add(&self, message: &ScheduledMessage) -> Result<()> {
        match self.messages.entry(message.token_id) {
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                Ok(())
            }
            Entry::Occupied(_) => Err(StorageError::DuplicateKey(format!(
                "scheduled {}",
                message.token_id
            ))),
        }
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self.messages.get(&token_id).map(|entry| entry.value().clone()))
    }

    async fn get_due(&self, now: DateTime<Utc>, max_count: usize) -> Result<Vec<ScheduledMessage>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut due: Vec<ScheduledMessage> = self
            .messages
            .iter()
            .filter(|entry| !entry.is_dispatched() && entry.scheduled_time <= now)
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by_key(|message| (message.scheduled_time, message.token_id));
        due.truncate(max_count);
        Ok(due)
    }

    async fn mark_dispatched(&self, token_id: Uuid, dispatched_time: DateTime<Utc>) -> Result<()> {
        if let Some(mut message) = self.messages.get_mut(&token_id) {
            message.dispatched_time.get_or_insert(dispatched_time);
        }
        Ok(())
    }

    async fn cancel(&self, token_id: Uuid) -> Result<bool> {
        Ok(self
            .messages
            .remove_if(&token_id, |_, message| !message.is_dispatched())
            .is_some())
    }
}
