//! Receive-side handler invocation and failure disposition.
//!
//! Backends hand each inbound message to [`ReceivePipeline::process`] and
//! then settle it with the broker according to the returned
//! [`Disposition`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};
use url::Url;

use crate::message::{headers, TransportMessage};
use crate::resilience::{ResiliencePipeline, TransportResilienceOptions};

use super::{
    ReceiveContext, ReceiveEndpointConfig, ReceiveEndpointFaultSettings, ReceiveHandler,
    SendTransport, TransportError, TransportHost, Result,
};

/// How the backend should settle a message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; acknowledge or commit.
    Acknowledge,
    /// Copied to the explicit dead-letter address; acknowledge the original.
    DeadLettered,
    /// Hand the message to the broker's own dead-letter mechanism.
    TransportDeadLetter,
    /// Negatively acknowledge for redelivery.
    Requeue,
}

impl Disposition {
    /// Whether the original delivery should be removed from the source.
    pub fn removes_original(self) -> bool {
        matches!(self, Disposition::Acknowledge | Disposition::DeadLettered)
    }
}

/// Copy of `message` annotated with dead-letter headers. Original headers
/// are preserved.
pub fn dead_letter_copy(message: &TransportMessage, reason: &str, description: &str) -> TransportMessage {
    message.with_headers([
        (headers::DEAD_LETTER_REASON, reason.to_string()),
        (headers::DEAD_LETTER_DESCRIPTION, description.to_string()),
        (headers::DEAD_LETTER_TIME, Utc::now().to_rfc3339()),
    ])
}

/// Handler plus the endpoint's resilience and dead-letter policy.
pub struct ReceivePipeline {
    input_address: Url,
    handler: Arc<dyn ReceiveHandler>,
    resilience: ResiliencePipeline,
    fault: ReceiveEndpointFaultSettings,
    dead_letter: Option<Arc<dyn SendTransport>>,
}

impl ReceivePipeline {
    /// Build the pipeline for `config`. Endpoint resilience options take
    /// precedence over `host_defaults`. The dead-letter transport, when an
    /// address is configured, comes from `host`.
    pub async fn build(
        host: &dyn TransportHost,
        config: &ReceiveEndpointConfig,
        host_defaults: Option<&TransportResilienceOptions>,
    ) -> Result<Self> {
        let fault = config.fault_settings.clone().unwrap_or_default();
        let options = fault.resilience.as_ref().or(host_defaults);
        let dead_letter = match &fault.dead_letter_address {
            Some(address) => Some(host.get_send_transport(address).await?),
            None => None,
        };

        Ok(Self {
            input_address: config.input_address.clone(),
            handler: config.handler.clone(),
            resilience: ResiliencePipeline::new(options),
            fault,
            dead_letter,
        })
    }

    pub fn input_address(&self) -> &Url {
        &self.input_address
    }

    pub fn resilience(&self) -> &ResiliencePipeline {
        &self.resilience
    }

    pub fn fault_settings(&self) -> &ReceiveEndpointFaultSettings {
        &self.fault
    }

    /// Run the handler under the endpoint policy and decide how to settle.
    pub async fn process(&self, context: Arc<ReceiveContext>) -> Disposition {
        let cancel = context.cancellation().clone();
        if cancel.is_cancelled() {
            return Disposition::Requeue;
        }

        let handler = self.handler.clone();
        let invocation = context.clone();
        let result = self
            .resilience
            .execute(move || handler.handle(invocation.clone()), &cancel)
            .await;

        match result {
            Ok(()) => {
                debug!(
                    address = %self.input_address,
                    message_id = ?context.message().message_id(),
                    "Message handled"
                );
                Disposition::Acknowledge
            }
            Err(TransportError::Cancelled) => Disposition::Requeue,
            Err(e) => self.on_failure(&context, &e).await,
        }
    }

    async fn on_failure(&self, context: &ReceiveContext, failure: &TransportError) -> Disposition {
        let message = context.message();
        warn!(
            address = %self.input_address,
            message_id = ?message.message_id(),
            message_type = ?message.message_type(),
            error = %failure,
            "Message handling failed"
        );

        if let Some(dead_letter) = &self.dead_letter {
            let reason = self
                .fault
                .dead_letter_reason
                .as_deref()
                .unwrap_or("HandlerFailure");
            let description = self
                .fault
                .dead_letter_description
                .clone()
                .unwrap_or_else(|| failure.to_string());
            let copy = dead_letter_copy(message, reason, &description);

            // Dead-lettering must complete even if the consumer is shutting down.
            let cancel = tokio_util::sync::CancellationToken::new();
            match dead_letter.send(&copy, &cancel).await {
                Ok(()) => {
                    warn!(address = %self.input_address, message_id = ?message.message_id(), "Message dead-lettered");
                    return Disposition::DeadLettered;
                }
                Err(e) => {
                    error!(address = %self.input_address, error = %e, "Dead-letter send failed");
                }
            }
        }

        if self.fault.use_transport_dead_letter {
            Disposition::TransportDeadLetter
        } else {
            Disposition::Requeue
        }
    }
}
