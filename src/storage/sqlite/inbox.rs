//! SQLite InboxStore.
//!
//! Idempotency rides on the (MessageId, ConsumerId) primary key:
//! `INSERT .. ON CONFLICT DO NOTHING` reports a duplicate as zero rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_timestamp, timestamp};
use crate::storage::schema::InboxStates;
use crate::storage::{InboxState, InboxStore, Result};

/// SQLite implementation of InboxStore.
pub struct SqliteInboxStore {
    pool: SqlitePool,
}

impl SqliteInboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn try_insert(conn: &mut SqliteConnection, state: &InboxState) -> Result<bool> {
        let (sql, values) = Query::insert()
            .into_table(InboxStates::Table)
            .columns([
                InboxStates::MessageId,
                InboxStates::ConsumerId,
                InboxStates::ReceivedTime,
                InboxStates::ProcessedTime,
            ])
            .values([
                state.message_id.to_string().into(),
                state.consumer_id.clone().into(),
                timestamp(state.received_time).into(),
                state.processed_time.map(timestamp).into(),
            ])?
            .on_conflict(
                OnConflict::columns([InboxStates::MessageId, InboxStates::ConsumerId])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    pub(crate) async fn set_processed(
        conn: &mut SqliteConnection,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()> {
        let (sql, values) = Query::update()
            .table(InboxStates::Table)
            .value(InboxStates::ProcessedTime, timestamp(processed_time))
            .and_where(Expr::col(InboxStates::MessageId).eq(message_id.to_string()))
            .and_where(Expr::col(InboxStates::ConsumerId).eq(consumer_id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl InboxStore for SqliteInboxStore {
    async fn get(&self, message_id: Uuid, consumer_id: &str) -> Result<Option<InboxState>> {
        let (sql, values) = Query::select()
            .columns([InboxStates::ReceivedTime, InboxStates::ProcessedTime])
            .from(InboxStates::Table)
            .and_where(Expr::col(InboxStates::MessageId).eq(message_id.to_string()))
            .and_where(Expr::col(InboxStates::ConsumerId).eq(consumer_id))
            .build_sqlx(SqliteQueryBuilder);

        let Some(row) = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let received: String = row.try_get("ReceivedTime")?;
        Ok(Some(InboxState {
            message_id,
            consumer_id: consumer_id.to_string(),
            received_time: parse_timestamp(&received)?,
            processed_time: parse_optional_timestamp(row.try_get("ProcessedTime")?)?,
        }))
    }

    async fn try_add(&self, state: &InboxState) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::try_insert(&mut conn, state).await
    }

    async fn mark_processed(
        &self,
        message_id: Uuid,
        consumer_id: &str,
        processed_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_processed(&mut conn, message_id, consumer_id, processed_time).await
    }
}
