//! Loads, applies and persists saga instances.

use std::sync::Arc;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Applied, Result, SagaEffect, SagaError, SagaHandler, SagaRegistry};
use crate::message::TransportMessage;
use crate::storage::SagaRepository;
use crate::utils::retry::{attempt_delays, saga_backoff};

/// What happened to one saga for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaInstanceStatus {
    Created,
    Updated,
    Completed,
    /// No instance matched and the message does not start one.
    Ignored,
    /// The instance already recorded this message id; nothing was applied.
    AlreadyHandled,
}

/// Result for one saga. Effects are to be emitted by the caller; the
/// instance is already persisted.
#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub state_type: String,
    pub correlation_id: Option<Uuid>,
    pub status: SagaInstanceStatus,
    pub effects: Vec<SagaEffect>,
}

impl SagaOutcome {
    fn ignored(state_type: &str, correlation_id: Option<Uuid>) -> Self {
        Self::without_effects(state_type, correlation_id, SagaInstanceStatus::Ignored)
    }

    fn without_effects(state_type: &str, correlation_id: Option<Uuid>, status: SagaInstanceStatus) -> Self {
        Self {
            state_type: state_type.to_string(),
            correlation_id,
            status,
            effects: Vec::new(),
        }
    }
}

/// Receives each saga's outcome as soon as its instance is persisted,
/// before the next saga runs.
#[async_trait]
pub trait SagaEffectSink: Send + Sync {
    async fn emit(&self, outcome: &SagaOutcome) -> Result<()>;
}

/// Leaves effects on the returned outcomes.
struct Deferred;

#[async_trait]
impl SagaEffectSink for Deferred {
    async fn emit(&self, _outcome: &SagaOutcome) -> Result<()> {
        Ok(())
    }
}

/// Routes messages to registered sagas.
pub struct SagaOrchestrator {
    repository: Arc<dyn SagaRepository>,
    registry: Arc<SagaRegistry>,
    backoff: ExponentialBuilder,
}

impl SagaOrchestrator {
    pub fn new(repository: Arc<dyn SagaRepository>, registry: Arc<SagaRegistry>) -> Self {
        Self {
            repository,
            registry,
            backoff: saga_backoff(),
        }
    }

    /// Backoff between re-reads after a version conflict.
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    /// Apply `message` to every saga that handles its type, leaving the
    /// effects on the returned outcomes.
    pub async fn handle(&self, message: &TransportMessage) -> Result<Vec<SagaOutcome>> {
        self.handle_with(message, &Deferred).await
    }

    /// Apply `message` to every saga that handles its type, handing each
    /// outcome to `sink` right after that saga is persisted.
    ///
    /// Stops at the first saga or sink error. Sagas handled before it keep
    /// their saved state and have recorded the message id, so a redelivery
    /// skips them and resumes at the saga that failed.
    pub async fn handle_with(
        &self,
        message: &TransportMessage,
        sink: &dyn SagaEffectSink,
    ) -> Result<Vec<SagaOutcome>> {
        let Some(message_type) = message.message_type() else {
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::new();
        for saga in self.registry.handlers_for(message_type) {
            let outcome = self.handle_one(saga.as_ref(), message_type, message).await?;
            sink.emit(&outcome).await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn handle_one(
        &self,
        saga: &dyn SagaHandler,
        message_type: &str,
        message: &TransportMessage,
    ) -> Result<SagaOutcome> {
        let state_type = saga.state_type();
        let Some(correlation_id) = saga.correlate(message) else {
            warn!(state_type, message_type, "Message has no correlation id for saga, ignoring");
            return Ok(SagaOutcome::ignored(state_type, None));
        };

        for (attempt, delay) in attempt_delays(self.backoff).enumerate() {
            if attempt > 0 {
                debug!(state_type, %correlation_id, attempt, ?delay, "Retrying saga after version conflict");
                tokio::time::sleep(delay).await;
            }

            let existing = self.repository.get(correlation_id, state_type).await?;
            let message_id = message.message_id();
            match (&existing, message_id) {
                (None, _) if !saga.starts(message_type) => {
                    debug!(state_type, %correlation_id, message_type, "No saga instance, ignoring");
                    return Ok(SagaOutcome::ignored(state_type, Some(correlation_id)));
                }
                (Some(stored), Some(id)) if stored.has_handled(id) => {
                    debug!(state_type, %correlation_id, message_id = %id, "Saga already handled message, skipping");
                    return Ok(SagaOutcome::without_effects(
                        state_type,
                        Some(correlation_id),
                        SagaInstanceStatus::AlreadyHandled,
                    ));
                }
                _ => {}
            }

            let Applied {
                mut state,
                effects,
                completed,
                is_new,
            } = saga.apply(existing, correlation_id, message)?;
            if let Some(id) = message_id {
                state.record_handled(id);
            }

            let status = if completed {
                if !is_new
                    && !self
                        .repository
                        .delete_if_version(correlation_id, state_type, state.version)
                        .await?
                {
                    continue;
                }
                info!(state_type, %correlation_id, "Saga completed");
                SagaInstanceStatus::Completed
            } else if self.repository.save(&mut state).await? {
                debug!(state_type, %correlation_id, version = state.version, "Saga saved");
                if is_new {
                    info!(state_type, %correlation_id, "Saga created");
                    SagaInstanceStatus::Created
                } else {
                    SagaInstanceStatus::Updated
                }
            } else {
                continue;
            };

            return Ok(SagaOutcome {
                state_type: state_type.to_string(),
                correlation_id: Some(correlation_id),
                status,
                effects,
            });
        }

        warn!(state_type, %correlation_id, "Saga retries exhausted on version conflicts");
        Err(SagaError::ConcurrencyConflict {
            state_type: state_type.to_string(),
            correlation_id,
        })
    }
}
