//! In-memory InboxStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::storage::{InboxState, InboxStore, Result};

type InboxKey = (Uuid, String);

/// Inbox rows keyed by (message id, consumer id).
#[derive(Default)]
pub struct InMemoryInboxStore {
    states: DashMap<InboxKey, InboxState>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every state or none. Returns the first key already present.
    pub(crate) fn insert_all(&self, states: Vec<InboxState>) -> std::result::Result<(), InboxKey> {
        let mut inserted = Vec::with_capacity(states.len());
        for state in states {
            let key = state.key();
            match self.states.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(state);
                    inserted.push(key);
                }
                Entry::Occupied(_) => {
                    self.remove_all(&inserted);
                    return Err(key);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn remove_all(&self, keys: &[InboxKey]) {
        for key in keys {
            self.states.remove(key);
        }
    }

    pub(crate) fn contains(&self, message_id: Uuid, consumer_id: &str) -> bool {
        self.states
            .contains_key(&(message_id, consumer_id.to_string()))
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn get(&self, message_id: Uuid, consumer_id: &str) -> Result<Option<InboxState>> {
        Ok(self
            .states
            .get(&(message_id, consumer_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn try_add(&self, state: &InboxState) -> Result<bool> {
        match self.states.entry(state.key()) {
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(mut state) = self
            .states
            .get_mut(&(message_id, consumer_id.to_string()))
        {
            state.processed_time = Some(processed_time);
        }
        Ok(())
    }
}
