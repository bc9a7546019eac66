//! Deferred send and publish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{Delivery, DispatchError, Result};
use crate::message::TransportMessage;
use crate::storage::{ScheduledMessage, ScheduledMessageStore};

/// Schedules messages for later delivery.
#[async_trait]
pub trait MessageScheduler: Send + Sync {
    /// Send `message` to `destination` at `scheduled_time`, which must be in
    /// the future.
    async fn schedule_send(
        &self,
        destination: &Url,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle>;

    /// Publish `message` by its type at `scheduled_time`, which must be in
    /// the future.
    async fn schedule_publish(
        &self,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle>;

    async fn schedule_send_after(
        &self,
        destination: &Url,
        message: TransportMessage,
        delay: Duration,
    ) -> Result<ScheduledMessageHandle> {
        let at = after(delay)?;
        self.schedule_send(destination, message, at).await
    }

    async fn schedule_publish_after(
        &self,
        message: TransportMessage,
        delay: Duration,
    ) -> Result<ScheduledMessageHandle> {
        let at = after(delay)?;
        self.schedule_publish(message, at).await
    }
}

fn after(delay: Duration) -> Result<DateTime<Utc>> {
    if delay.is_zero() {
        return Err(DispatchError::InvalidArgument(
            "delay must be greater than zero".to_string(),
        ));
    }
    let delta = chrono::Duration::from_std(delay)
        .map_err(|e| DispatchError::InvalidArgument(format!("delay out of range: {e}")))?;
    Ok(Utc::now() + delta)
}

fn ensure_future(scheduled_time: DateTime<Utc>) -> Result<()> {
    if scheduled_time <= Utc::now() {
        return Err(DispatchError::InvalidArgument(format!(
            "scheduled time {scheduled_time} must be in the future"
        )));
    }
    Ok(())
}

fn required_type(message: &TransportMessage) -> Result<String> {
    message
        .message_type()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| DispatchError::InvalidArgument("scheduled message needs a message type".to_string()))
}

type PendingTimers = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

#[derive(Clone)]
enum Canceller {
    Store(Arc<dyn ScheduledMessageStore>),
    Timer(PendingTimers),
}

/// Reference to one scheduled message.
#[derive(Clone)]
pub struct ScheduledMessageHandle {
    token_id: Uuid,
    scheduled_time: DateTime<Utc>,
    canceller: Canceller,
}

impl ScheduledMessageHandle {
    pub fn token_id(&self) -> Uuid {
        self.token_id
    }

    pub fn scheduled_time(&self) -> DateTime<Utc> {
        self.scheduled_time
    }

    /// Cancel the message. Returns `false` when it was already dispatched
    /// or cancelled.
    pub async fn cancel(&self) -> Result<bool> {
        let cancelled = match &self.canceller {
            Canceller::Store(store) => store.cancel(self.token_id).await?,
            Canceller::Timer(pending) => {
                let timer = pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&self.token_id);
                timer.map(|token| token.cancel()).is_some()
            }
        };
        if cancelled {
            debug!(token_id = %self.token_id, "Scheduled message cancelled");
        }
        Ok(cancelled)
    }
}

impl std::fmt::Debug for ScheduledMessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledMessageHandle")
            .field("token_id", &self.token_id)
            .field("scheduled_time", &self.scheduled_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Persisted
// ============================================================================

/// Writes scheduled messages to a store; a
/// [`ScheduledMessageDispatcher`](super::ScheduledMessageDispatcher)
/// delivers them.
pub struct PersistedMessageScheduler {
    store: Arc<dyn ScheduledMessageStore>,
}

impl PersistedMessageScheduler {
    pub fn new(store: Arc<dyn ScheduledMessageStore>) -> Self {
        Self { store }
    }

    async fn persist(
        &self,
        destination: Option<&Url>,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        ensure_future(scheduled_time)?;
        let message_type = required_type(&message)?;
        let token_id = Uuid::now_v7();
        let record = ScheduledMessage::from_transport(token_id, &message, message_type, destination, scheduled_time);
        self.store.add(&record).await?;

        info!(
            token_id = %token_id,
            message_type = %record.message_type,
            scheduled_time = %scheduled_time,
            "Message scheduled"
        );
        Ok(ScheduledMessageHandle {
            token_id,
            scheduled_time,
            canceller: Canceller::Store(self.store.clone()),
        })
    }
}

#[async_trait]
impl MessageScheduler for PersistedMessageScheduler {
    async fn schedule_send(
        &self,
        destination: &Url,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        self.persist(Some(destination), message, scheduled_time).await
    }

    async fn schedule_publish(
        &self,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        self.persist(None, message, scheduled_time).await
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Holds scheduled messages on in-process timers. Nothing survives a
/// restart.
pub struct InMemoryMessageScheduler {
    delivery: Delivery,
    pending: PendingTimers,
    shutdown: CancellationToken,
}

impl InMemoryMessageScheduler {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Drop every pending timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn arm(
        &self,
        destination: Option<Url>,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        ensure_future(scheduled_time)?;
        required_type(&message)?;
        let wait = (scheduled_time - Utc::now()).to_std().unwrap_or_default();
        let token_id = Uuid::now_v7();
        let timer = self.shutdown.child_token();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token_id, timer.clone());

        let delivery = self.delivery.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            let still_pending = pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&token_id)
                .is_some();
            if !still_pending {
                return;
            }

            let cancel = CancellationToken::new();
            let result = match &destination {
                Some(address) => delivery.send(address, &message, &cancel).await,
                None => delivery.publish(None, &message, &cancel).await,
            };
            match result {
                Ok(()) => debug!(token_id = %token_id, "Scheduled message delivered"),
                Err(e) => warn!(token_id = %token_id, error = %e, "Scheduled message delivery failed"),
            }
        });

        Ok(ScheduledMessageHandle {
            token_id,
            scheduled_time,
            canceller: Canceller::Timer(self.pending.clone()),
        })
    }
}

impl Drop for InMemoryMessageScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl MessageScheduler for InMemoryMessageScheduler {
    async fn schedule_send(
        &self,
        destination: &Url,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        self.arm(Some(destination.clone()), message, scheduled_time)
    }

    async fn schedule_publish(
        &self,
        message: TransportMessage,
        scheduled_time: DateTime<Utc>,
    ) -> Result<ScheduledMessageHandle> {
        self.arm(None, message, scheduled_time)
    }
}
