//! Outbox polling and delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::{spawn_poll_loop, Delivery, DispatchReport, DispatcherHandle, Result};
use crate::message::TransportMessage;
use crate::storage::{OutboxMessage, OutboxStore};
use crate::transport::{address_key, TransportError};

/// Outbox dispatcher settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutboxDispatchOptions {
    /// Pending rows read per cycle.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Destinations delivered to concurrently within a cycle.
    pub max_concurrent_destinations: usize,
    /// Rows that can never be routed are copied here and marked sent.
    /// Without it they stay pending.
    pub dead_letter_address: Option<Url>,
}

impl Default for OutboxDispatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1_000,
            max_concurrent_destinations: 8,
            dead_letter_address: None,
        }
    }
}

impl OutboxDispatchOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

enum RowOutcome {
    Sent,
    DeadLettered,
    Failed,
}

/// Delivers pending outbox rows and marks them sent.
///
/// Each cycle delivers at most one row per destination, the oldest, so
/// rows for one destination leave in enqueue order. Publish rows are keyed
/// by message type.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    delivery: Delivery,
    options: OutboxDispatchOptions,
}

impl OutboxDispatcher {
    pub fn new(outbox: Arc<dyn OutboxStore>, delivery: Delivery, options: OutboxDispatchOptions) -> Self {
        Self {
            outbox,
            delivery,
            options,
        }
    }

    pub fn options(&self) -> &OutboxDispatchOptions {
        &self.options
    }

    /// Start polling until the handle is stopped or `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> DispatcherHandle {
        let interval = self.options.poll_interval();
        spawn_poll_loop("outbox", interval, cancel, move |token| {
            let dispatcher = self.clone();
            async move { dispatcher.dispatch_once(&token).await }
        })
    }

    /// Run one poll cycle.
    pub async fn dispatch_once(&self, cancel: &CancellationToken) -> Result<DispatchReport> {
        let pending = self.outbox.get_pending(self.options.batch_size).await?;
        let mut report = DispatchReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut claimed = HashSet::new();
        let mut batch = Vec::new();
        for row in pending {
            match destination_key(&row) {
                Some(key) => {
                    if claimed.insert(key) {
                        batch.push(row);
                    } else {
                        report.deferred += 1;
                    }
                }
                None => batch.push(row),
            }
        }

        let outcomes: Vec<RowOutcome> = stream::iter(batch)
            .map(|row| async move { self.dispatch_row(row, cancel).await })
            .buffer_unordered(self.options.max_concurrent_destinations.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                RowOutcome::Sent => report.dispatched += 1,
                RowOutcome::DeadLettered => report.dead_lettered += 1,
                RowOutcome::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn dispatch_row(&self, row: OutboxMessage, cancel: &CancellationToken) -> RowOutcome {
        let message = row.to_transport();
        let result = match &row.destination_address {
            Some(destination) => self.delivery.send(destination, &message, cancel).await,
            None => {
                self.delivery
                    .publish(row.source_address.as_ref(), &message, cancel)
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(message_id = %row.message_id, destination = ?row.destination_address.as_ref().map(Url::as_str), "Outbox message dispatched");
                self.mark_sent(&row, RowOutcome::Sent).await
            }
            Err(TransportError::Configuration(reason)) => self.unroutable(&row, &message, &reason, cancel).await,
            Err(e) => {
                warn!(
                    message_id = %row.message_id,
                    message_type = ?row.message_type,
                    error = %e,
                    "Outbox dispatch failed, will retry"
                );
                RowOutcome::Failed
            }
        }
    }

    async fn unroutable(
        &self,
        row: &OutboxMessage,
        message: &TransportMessage,
        reason: &str,
        cancel: &CancellationToken,
    ) -> RowOutcome {
        error!(message_id = %row.message_id, reason, "Outbox message cannot be routed");
        let Some(dead_letter) = &self.options.dead_letter_address else {
            return RowOutcome::Failed;
        };

        match self
            .delivery
            .dead_letter(dead_letter, message, "UnresolvableDestination", reason, cancel)
            .await
        {
            Ok(()) => self.mark_sent(row, RowOutcome::DeadLettered).await,
            Err(e) => {
                error!(message_id = %row.message_id, error = %e, "Outbox dead-letter send failed");
                RowOutcome::Failed
            }
        }
    }

    async fn mark_sent(&self, row: &OutboxMessage, outcome: RowOutcome) -> RowOutcome {
        match self.outbox.mark_sent(row.message_id, Utc::now()).await {
            Ok(()) => outcome,
            Err(e) => {
                // Delivered but still pending: the next cycle sends it again.
                error!(message_id = %row.message_id, error = %e, "Failed to mark outbox message sent");
                RowOutcome::Failed
            }
        }
    }
}

/// Ordering key: the destination address, or the message type for
/// publishes. Rows with neither are never grouped.
fn destination_key(row: &OutboxMessage) -> Option<String> {
    match (&row.destination_address, &row.message_type) {
        (Some(destination), _) => Some(address_key(destination)),
        (None, Some(message_type)) if !message_type.trim().is_empty() => {
            Some(format!("publish:{message_type}"))
        }
        _ => None,
    }
}
