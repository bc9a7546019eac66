//! Background delivery of persisted messages.
//!
//! - [`OutboxDispatcher`] drains pending outbox rows to their transports.
//! - [`ScheduledMessageDispatcher`] sends or publishes scheduled messages
//!   once they fall due.
//! - [`MessageScheduler`] records deferred messages, either persisted for
//!   the scheduled dispatcher or held on in-process timers.
//!
//! Both dispatchers poll independently and stop through their
//! [`DispatcherHandle`]. A failed delivery leaves the row for the next
//! cycle, so downstream consumers see at-least-once delivery.

mod outbox;
mod scheduled;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::message::TransportMessage;
use crate::storage::StorageError;
use crate::transport::receive::dead_letter_copy;
use crate::transport::registry::TransportHostProvider;
use crate::transport::TransportError;

pub use outbox::{OutboxDispatchOptions, OutboxDispatcher};
pub use scheduled::{ScheduledDispatchOptions, ScheduledMessageDispatcher};
pub use scheduler::{
    InMemoryMessageScheduler, MessageScheduler, PersistedMessageScheduler, ScheduledMessageHandle,
};

/// Result type for dispatch and scheduling operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by dispatchers and schedulers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A caller-supplied argument was rejected, e.g. a schedule in the past.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Counts from one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Delivered and marked.
    pub dispatched: usize,
    /// Copied to the dead-letter address and marked.
    pub dead_lettered: usize,
    /// Left pending after a failure.
    pub failed: usize,
    /// Left pending because an earlier row for the same destination was
    /// dispatched in this cycle.
    pub deferred: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.dispatched + self.dead_lettered + self.failed + self.deferred
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Routes a message to the transport host serving its address.
///
/// Sends go to the host of the destination. Publishes go through the host
/// of the source address, or the configured publish address when the
/// message has no source.
#[derive(Clone)]
pub struct Delivery {
    hosts: Arc<TransportHostProvider>,
    publish_address: Option<Url>,
}

impl Delivery {
    pub fn new(hosts: Arc<TransportHostProvider>) -> Self {
        Self {
            hosts,
            publish_address: None,
        }
    }

    pub fn with_publish_address(mut self, address: Url) -> Self {
        self.publish_address = Some(address);
        self
    }

    pub fn hosts(&self) -> &Arc<TransportHostProvider> {
        &self.hosts
    }

    pub fn publish_address(&self) -> Option<&Url> {
        self.publish_address.as_ref()
    }

    pub async fn send(
        &self,
        destination: &Url,
        message: &TransportMessage,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let host = self.hosts.get_host(destination)?;
        let transport = host.get_send_transport(destination).await?;
        transport.send(message, cancel).await
    }

    pub async fn publish(
        &self,
        source: Option<&Url>,
        message: &TransportMessage,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let message_type = message
            .message_type()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                TransportError::Configuration("publish requires a message type".to_string())
            })?;
        let address = source.or(self.publish_address.as_ref()).ok_or_else(|| {
            TransportError::Configuration(format!(
                "no source or publish address to publish '{message_type}' through"
            ))
        })?;
        let host = self.hosts.get_host(address)?;
        let transport = host.get_publish_transport(message_type).await?;
        transport.publish(message, cancel).await
    }

    /// Send a copy of `message` with dead-letter headers to `address`.
    pub async fn dead_letter(
        &self,
        address: &Url,
        message: &TransportMessage,
        reason: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        let copy = dead_letter_copy(message, reason, description);
        self.send(address, &copy, cancel).await?;
        warn!(
            address = %address,
            message_id = ?message.message_id(),
            reason,
            description,
            "Message sent to dead-letter address"
        );
        Ok(())
    }
}

// ============================================================================
// Poll loop
// ============================================================================

/// A running background loop.
pub struct DispatcherHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for the current cycle to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(dispatcher = self.name, error = %e, "Dispatcher task ended abnormally");
        }
        info!(dispatcher = self.name, "Dispatcher stopped");
    }
}

/// Run `cycle` now and then every `interval` until `cancel` fires.
pub(crate) fn spawn_poll_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut cycle: F,
) -> DispatcherHandle
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<DispatchReport>> + Send,
{
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        info!(dispatcher = name, interval_ms = interval.as_millis() as u64, "Dispatcher started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match cycle(token.clone()).await {
                Ok(report) if report.total() > 0 => {
                    debug!(
                        dispatcher = name,
                        dispatched = report.dispatched,
                        dead_lettered = report.dead_lettered,
                        failed = report.failed,
                        deferred = report.deferred,
                        "Dispatch cycle complete"
                    );
                }
                Ok(_) => {}
                Err(DispatchError::Transport(TransportError::Cancelled)) => break,
                Err(e) => {
                    warn!(dispatcher = name, error = %e, "Dispatch cycle failed");
                }
            }
        }
    });

    DispatcherHandle { name, cancel, task }
}

#[cfg(test)]
mod tests;
