//! SQLite StorageSession over a database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{SqliteInboxStore, SqliteOutboxStore};
use crate::storage::{
    InboxState, OutboxMessage, Result, StorageSession, StorageSessionFactory,
};

/// Opens transactions on a pool.
#[derive(Clone)]
pub struct SqliteSessionFactory {
    pool: SqlitePool,
}

impl SqliteSessionFactory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageSessionFactory for SqliteSessionFactory {
    async fn begin(&self) -> Result<Box<dyn StorageSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteStorageSession { tx }))
    }
}

/// Inbox and outbox writes inside one transaction. Dropping the session
/// rolls the transaction back.
pub struct SqliteStorageSession {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StorageSession for SqliteStorageSession {
    async fn try_add_inbox(&mut self, state: &InboxState) -> Result<bool> {
        SqliteInboxStore::try_insert(&mut self.tx, state).await
    }

    async fn mark_inbox_processed(
        &mut self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()> {
        SqliteInboxStore::set_processed(&mut self.tx, message_id, consumer_id, processed_time).await
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        SqliteOutboxStore::insert(&mut self.tx, message).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        debug!("SQLite session committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        debug!("SQLite session rolled back");
        Ok(())
    }
}
