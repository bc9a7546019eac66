//! In-memory SagaRepository.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::storage::{Result, SagaRepository, SagaState, StorageError};

/// Saga rows keyed by (correlation id, state type).
#[derive(Default)]
pub struct InMemorySagaRepository {
    states: DashMap<(Uuid, String), SagaState>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn get(&self, correlation_id: Uuid, state_type: &str) -> Result<Option<SagaState>> {
        Ok(self
            .states
            .get(&(correlation_id, state_type.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, state: &mut SagaState) -> Result<bool> {
        if state.correlation_id.is_nil() {
            return Err(StorageError::InvalidRecord(
                "saga correlation id must not be nil".to_string(),
            ));
        }

        let key = (state.correlation_id, state.state_type.clone());
        match self.states.entry(key) {
            Entry::Vacant(slot) => {
                state.version = 1;
                state.updated_time = Utc::now();
                slot.insert(state.clone());
            }
            Entry::Occupied(mut slot) if slot.get().version == state.version => {
                state.version += 1;
                state.updated_time = Utc::now();
                slot.insert(state.clone());
            }
            Entry::Occupied(_) => return Ok(false),
        }
        Ok(true)
    }

    async fn delete(&self, correlation_id: Uuid, state_type: &str) -> Result<()> {
        self.states.remove(&(correlation_id, state_type.to_string()));
        Ok(())
    }

    async fn delete_if_version(
        &self,
        correlation_id: Uuid,
        state_type: &str,
        version: i64,
    ) -> Result<bool> {
        Ok(self
            .states
            .remove_if(&(correlation_id, state_type.to_string()), |_, stored| {
                stored.version == version
            })
            .is_some())
    }
}
