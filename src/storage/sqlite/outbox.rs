//! SQLite OutboxStore.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use url::Url;
use uuid::Uuid;

use super::{
    decode_headers, encode_headers, parse_optional_timestamp, parse_optional_uuid,
    parse_timestamp, timestamp,
};
use crate::storage::schema::OutboxMessages;
use crate::storage::{OutboxMessage, OutboxStore, Result, StorageError};

const COLUMNS: [OutboxMessages; 11] = [
    OutboxMessages::MessageId,
    OutboxMessages::CorrelationId,
    OutboxMessages::ConversationId,
    OutboxMessages::SourceAddress,
    OutboxMessages::DestinationAddress,
    OutboxMessages::MessageType,
    OutboxMessages::ContentType,
    OutboxMessages::Body,
    OutboxMessages::Headers,
    OutboxMessages::EnqueuedTime,
    OutboxMessages::SentTime,
];

/// SQLite implementation of OutboxStore.
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new row on an existing connection, so sessions can write
    /// inside their transaction. A stored id is left untouched and reported
    /// as a duplicate.
    pub(crate) async fn insert(conn: &mut SqliteConnection, message: &OutboxMessage) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(OutboxMessages::Table)
            .columns(COLUMNS)
            .values([
                message.message_id.to_string().into(),
                message.correlation_id.map(|id| id.to_string()).into(),
                message.conversation_id.map(|id| id.to_string()).into(),
                message.source_address.as_ref().map(Url::to_string).into(),
                message.destination_address.as_ref().map(Url::to_string).into(),
                message.message_type.clone().into(),
                message.content_type.clone().into(),
                message.body.to_vec().into(),
                encode_headers(&message.headers)?.into(),
                timestamp(message.enqueued_time).into(),
                message.sent_time.map(timestamp).into(),
            ])?
            .on_conflict(
                OnConflict::column(OutboxMessages::MessageId)
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let inserted = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        if inserted.rows_affected() == 0 {
            return Err(StorageError::DuplicateKey(format!("outbox {}", message.message_id)));
        }
        Ok(())
    }
}

fn parse_url(raw: Option<String>) -> Result<Option<Url>> {
    raw.map(|raw| {
        Url::parse(&raw).map_err(|e| StorageError::InvalidRecord(format!("address '{raw}': {e}")))
    })
    .transpose()
}

fn from_row(row: &SqliteRow) -> Result<OutboxMessage> {
    let message_id: String = row.try_get("MessageId")?;
    let body: Vec<u8> = row.try_get("Body")?;
    let headers: String = row.try_get("Headers")?;
    let enqueued: String = row.try_get("EnqueuedTime")?;

    Ok(OutboxMessage {
        message_id: Uuid::parse_str(&message_id)?,
        correlation_id: parse_optional_uuid(row.try_get("CorrelationId")?)?,
        conversation_id: parse_optional_uuid(row.try_get("ConversationId")?)?,
        source_address: parse_url(row.try_get("SourceAddress")?)?,
        destination_address: parse_url(row.try_get("DestinationAddress")?)?,
        message_type: row.try_get("MessageType")?,
        content_type: row.try_get("ContentType")?,
        body: Bytes::from(body),
        headers: decode_headers(&headers)?,
        enqueued_time: parse_timestamp(&enqueued)?,
        sent_time: parse_optional_timestamp(row.try_get("SentTime")?)?,
    })
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn add(&self, message: &OutboxMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert(&mut conn, message).await
    }

    async fn get_pending(&self, max_count: usize) -> Result<Vec<OutboxMessage>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(OutboxMessages::Table)
            .and_where(Expr::col(OutboxMessages::SentTime).is_null())
            .order_by(OutboxMessages::EnqueuedTime, Order::Asc)
            .order_by(OutboxMessages::MessageId, Order::Asc)
            .limit(max_count as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(from_row).collect()
    }

    async fn mark_sent(&self, message_id: Uuid, sent_time: DateTime<Utc>) -> Result<()> {
        let (sql, values) = Query::update()
            .table(OutboxMessages::Table)
            .value(OutboxMessages::SentTime, timestamp(sent_time))
            .and_where(Expr::col(OutboxMessages::MessageId).eq(message_id.to_string()))
            .and_where(Expr::col(OutboxMessages::SentTime).is_null())
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }
}
