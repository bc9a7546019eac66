//! Dispatch of persisted scheduled messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::{spawn_poll_loop, Delivery, DispatchReport, DispatcherHandle, Result};
use crate::message::headers;
use crate::storage::{ScheduledMessage, ScheduledMessageStore};
use crate::transport::TransportError;

/// Scheduled dispatcher settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduledDispatchOptions {
    /// Due messages read per cycle.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Messages that can never be dispatched are copied here and marked
    /// dispatched. Without it they stay due.
    pub dead_letter_address: Option<Url>,
}

impl Default for ScheduledDispatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            dead_letter_address: None,
        }
    }
}

impl ScheduledDispatchOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Sends or publishes scheduled messages once due.
pub struct ScheduledMessageDispatcher {
    store: Arc<dyn ScheduledMessageStore>,
    delivery: Delivery,
    options: ScheduledDispatchOptions,
}

impl ScheduledMessageDispatcher {
    pub fn new(
        store: Arc<dyn ScheduledMessageStore>,
        delivery: Delivery,
        options: ScheduledDispatchOptions,
    ) -> Self {
        Self {
            store,
            delivery,
            options,
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> DispatcherHandle {
        let interval = self.options.poll_interval();
        spawn_poll_loop("scheduler", interval, cancel, move |token| {
            let dispatcher = self.clone();
            async move { dispatcher.dispatch_once(&token).await }
        })
    }

    /// Dispatch everything due now, earliest first.
    pub async fn dispatch_once(&self, cancel: &CancellationToken) -> Result<DispatchReport> {
        let due = self.store.get_due(Utc::now(), self.options.batch_size).await?;
        let mut report = DispatchReport::default();

        for scheduled in due {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled.into());
            }

            if scheduled.message_type.trim().is_empty() {
                self.reject(&scheduled, "MissingMessageType", "message type is empty", &mut report, cancel)
                    .await;
                continue;
            }

            let raw_destination = scheduled.headers.get(headers::DESTINATION_ADDRESS);
            let destination = match raw_destination.map(Url::parse) {
                None => None,
                Some(Ok(address)) => Some(address),
                Some(Err(e)) => {
                    let description = format!("invalid destination address: {e}");
                    self.reject(&scheduled, "InvalidDestinationAddress", &description, &mut report, cancel)
                        .await;
                    continue;
                }
            };

            let message = scheduled.to_transport();
            let result = match &destination {
                Some(address) => self.delivery.send(address, &message, cancel).await,
                None => self.delivery.publish(None, &message, cancel).await,
            };

            match result {
                Ok(()) => {
                    debug!(token_id = %scheduled.token_id, message_type = %scheduled.message_type, "Scheduled message dispatched");
                    match self.store.mark_dispatched(scheduled.token_id, Utc::now()).await {
                        Ok(()) => report.dispatched += 1,
                        Err(e) => {
                            error!(token_id = %scheduled.token_id, error = %e, "Failed to mark scheduled message dispatched");
                            report.failed += 1;
                        }
                    }
                }
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled.into()),
                Err(TransportError::Configuration(reason)) => {
                    self.reject(&scheduled, "UnresolvableDestination", &reason, &mut report, cancel)
                        .await;
                }
                Err(e) => {
                    warn!(
                        token_id = %scheduled.token_id,
                        message_type = %scheduled.message_type,
                        destination = ?destination.as_ref().map(Url::as_str),
                        error = %e,
                        "Scheduled dispatch failed, will retry"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Dead-letter a message that can never be dispatched. Without a
    /// dead-letter address it stays due.
    async fn reject(
        &self,
        scheduled: &ScheduledMessage,
        reason: &str,
        description: &str,
        report: &mut DispatchReport,
        cancel: &CancellationToken,
    ) {
        warn!(token_id = %scheduled.token_id, reason, description, "Scheduled message cannot be dispatched");
        let Some(dead_letter) = &self.options.dead_letter_address else {
            report.failed += 1;
            return;
        };

        let message = scheduled.to_transport();
        let result = self
            .delivery
            .dead_letter(dead_letter, &message, reason, description, cancel)
            .await;
        if let Err(e) = result {
            error!(token_id = %scheduled.token_id, error = %e, "Scheduled dead-letter send failed");
            report.failed += 1;
            return;
        }

        match self.store.mark_dispatched(scheduled.token_id, Utc::now()).await {
            Ok(()) => report.dead_lettered += 1,
            Err(e) => {
                error!(token_id = %scheduled.token_id, error = %e, "Failed to mark scheduled message dispatched");
                report.failed += 1;
            }
        }
    }
}
