//! SQLite ScheduledMessageStore.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{decode_headers, encode_headers, parse_optional_timestamp, parse_timestamp, timestamp};
use crate::storage::schema::ScheduledMessages;
use crate::storage::{Result, ScheduledMessage, ScheduledMessageStore, StorageError};

const COLUMNS: [ScheduledMessages; 8] = [
    ScheduledMessages::TokenId,
    ScheduledMessages::MessageType,
    ScheduledMessages::ContentType,
    ScheduledMessages::Body,
    ScheduledMessages::Headers,
    ScheduledMessages::ScheduledTime,
    ScheduledMessages::CreatedTime,
    ScheduledMessages::DispatchedTime,
];

/// SQLite implementation of ScheduledMessageStore. Cancelled rows are
/// deleted.
pub struct SqliteScheduledMessageStore {
    pool: SqlitePool,
}

impl SqliteScheduledMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_row(row: &SqliteRow) -> Result<ScheduledMessage> {
    let token_id: String = row.try_get("TokenId")?;
    let body: Vec<u8> = row.try_get("Body")?;
    let headers: String = row.try_get("Headers")?;
    let scheduled: String = row.try_get("ScheduledTime")?;
    let created: String = row.try_get("CreatedTime")?;

    Ok(ScheduledMessage {
        token_id: Uuid::parse_str(&token_id)?,
        message_type: row.try_get("MessageType")?,
        content_type: row.try_get("ContentType")?,
        body: Bytes::from(body),
        headers: decode_headers(&headers)?,
        scheduled_time: parse_timestamp(&scheduled)?,
        created_time: parse_timestamp(&created)?,
        dispatched_time: parse_optional_timestamp(row.try_get("DispatchedTime")?)?,
    })
}

#[async_trait]
impl ScheduledMessageStore for SqliteScheduledMessageStore {
    async fn add(&self, message: &ScheduledMessage) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(ScheduledMessages::Table)
            .columns(COLUMNS)
            .values([
                message.token_id.to_string().into(),
                message.message_type.clone().into(),
                message.content_type.clone().into(),
                message.body.to_vec().into(),
                encode_headers(&message.headers)?.into(),
                timestamp(message.scheduled_time).into(),
                timestamp(message.created_time).into(),
                message.dispatched_time.map(timestamp).into(),
            ])?
            .on_conflict(
                OnConflict::column(ScheduledMessages::TokenId)
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let inserted = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if inserted.rows_affected() == 0 {
            return Err(StorageError::DuplicateKey(format!("scheduled {}", message.token_id)));
        }
        Ok(())
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<ScheduledMessage>> {
        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(ScheduledMessages::Table)
            .and_where(Expr::col(ScheduledMessages::TokenId).eq(token_id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(from_row)
            .transpose()
    }

    async fn get_due(&self, now: DateTime<Utc>, max_count: usize) -> Result<Vec<ScheduledMessage>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(ScheduledMessages::Table)
            .and_where(Expr::col(ScheduledMessages::DispatchedTime).is_null())
            .and_where(Expr::col(ScheduledMessages::ScheduledTime).lte(timestamp(now)))
            .order_by(ScheduledMessages::ScheduledTime, Order::Asc)
            .order_by(ScheduledMessages::TokenId, Order::Asc)
            .limit(max_count as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(from_row).collect()
    }

    async fn mark_dispatched(&self, token_id: Uuid, dispatched_time: DateTime<Utc>) -> Result<()> {
        let (sql, values) = Query::update()
            .table(ScheduledMessages::Table)
            .value(ScheduledMessages::DispatchedTime, timestamp(dispatched_time))
            .and_where(Expr::col(ScheduledMessages::TokenId).eq(token_id.to_string()))
            .and_where(Expr::col(ScheduledMessages::DispatchedTime).is_null())
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    async fn cancel(&self, token_id: Uuid) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(ScheduledMessages::Table)
            .and_where(Expr::col(ScheduledMessages::TokenId).eq(token_id.to_string()))
            .and_where(Expr::col(ScheduledMessages::DispatchedTime).is_null())
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
