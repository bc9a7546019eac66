//! Transactional outbox staging.
//!
//! Outgoing messages are staged as outbox rows inside the caller's
//! [`StorageSession`], so they commit atomically with the business write.
//! After the commit, [`Bus::publish_staged`] delivers them right away; the
//! outbox dispatcher picks up anything that could not be delivered.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{Bus, BusError, Result};
use crate::message::Message;
use crate::storage::{OutboxMessage, StorageSession};

/// An outbox row written in an uncommitted session.
#[derive(Debug, Clone)]
pub struct StagedMessage {
    record: OutboxMessage,
}

impl StagedMessage {
    pub fn id(&self) -> Uuid {
        self.record.message_id
    }

    pub fn record(&self) -> &OutboxMessage {
        &self.record
    }
}

impl Bus {
    /// Stage a send to `destination` in `session`.
    pub async fn stage_send<M: Message>(
        &self,
        session: &mut dyn StorageSession,
        destination: &Url,
        message: &M,
    ) -> Result<StagedMessage> {
        self.stage(session, Some(destination.clone()), message).await
    }

    /// Stage a publish in `session`.
    pub async fn stage_publish<M: Message>(
        &self,
        session: &mut dyn StorageSession,
        message: &M,
    ) -> Result<StagedMessage> {
        self.stage(session, None, message).await
    }

    async fn stage<M: Message>(
        &self,
        session: &mut dyn StorageSession,
        destination: Option<Url>,
        message: &M,
    ) -> Result<StagedMessage> {
        let outgoing = self.core.envelope(message, None, None)?.build();
        let record = OutboxMessage::from_transport(&outgoing, Some(self.core.address.clone()), destination);
        session.add_outbox(&record).await?;
        debug!(message_id = %record.message_id, message_type = M::MESSAGE_TYPE, "Message staged in outbox");
        Ok(StagedMessage { record })
    }

    /// Deliver a committed staged message now and mark it sent.
    ///
    /// Returns `false` when delivery failed; the row stays pending for the
    /// outbox dispatcher. Call only after the staging session committed.
    pub async fn publish_staged(&self, staged: &StagedMessage, cancel: &CancellationToken) -> Result<bool> {
        let outbox = self.core.outbox.as_ref().ok_or_else(|| {
            BusError::Configuration("publishing staged messages requires an outbox store".to_string())
        })?;

        let record = &staged.record;
        let message = record.to_transport();
        let delivered = match &record.destination_address {
            Some(destination) => self.core.delivery.send(destination, &message, cancel).await,
            None => {
                self.core
                    .delivery
                    .publish(record.source_address.as_ref(), &message, cancel)
                    .await
            }
        };

        if let Err(e) = delivered {
            warn!(message_id = %record.message_id, error = %e, "Staged message delivery failed, left for the outbox dispatcher");
            return Ok(false);
        }
        outbox.mark_sent(record.message_id, Utc::now()).await?;
        debug!(message_id = %record.message_id, "Staged message delivered");
        Ok(true)
    }
}
