//! SQLite SagaRepository.
//!
//! Updates are conditional on the stored version (`WHERE Version = ?`);
//! a row that does not exist yet is inserted at version 1 and a racing
//! insert loses on the primary key.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_uuid, parse_timestamp, timestamp};
use crate::storage::schema::SagaStates;
use crate::storage::{Result, SagaRepository, SagaState, StorageError};

/// SQLite implementation of SagaRepository.
pub struct SqliteSagaRepository {
    pool: SqlitePool,
}

impl SqliteSagaRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaRepository for SqliteSagaRepository {
    async fn get(&self, correlation_id: Uuid, state_type: &str) -> Result<Option<SagaState>> {
        let (sql, values) = Query::select()
            .columns([
                SagaStates::StateData,
                SagaStates::ConversationId,
                SagaStates::UpdatedTime,
                SagaStates::Version,
                SagaStates::HandledMessages,
            ])
            .from(SagaStates::Table)
            .and_where(Expr::col(SagaStates::CorrelationId).eq(correlation_id.to_string()))
            .and_where(Expr::col(SagaStates::StateType).eq(state_type))
            .build_sqlx(SqliteQueryBuilder);

        let Some(row) = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let data: String = row.try_get("StateData")?;
        let updated: String = row.try_get("UpdatedTime")?;
        let handled: String = row.try_get("HandledMessages")?;
        Ok(Some(SagaState {
            correlation_id,
            state_type: state_type.to_string(),
            conversation_id: parse_optional_uuid(row.try_get("ConversationId")?)?,
            version: row.try_get("Version")?,
            data: serde_json::from_str(&data)?,
            updated_time: parse_timestamp(&updated)?,
            handled_messages: serde_json::from_str(&handled)?,
        }))
    }

    async fn save(&self, state: &mut SagaState) -> Result<bool> {
        if state.correlation_id.is_nil() {
            return Err(StorageError::InvalidRecord(
                "saga correlation id must not be nil".to_string(),
            ));
        }

        let now = Utc::now();
        let data = serde_json::to_string(&state.data)?;
        let conversation = state.conversation_id.map(|id| id.to_string());
        let handled = serde_json::to_string(&state.handled_messages)?;

        let (sql, values) = Query::update()
            .table(SagaStates::Table)
            .value(SagaStates::StateData, data.clone())
            .value(SagaStates::ConversationId, conversation.clone())
            .value(SagaStates::UpdatedTime, timestamp(now))
            .value(SagaStates::HandledMessages, handled.clone())
            .value(SagaStates::Version, Expr::col(SagaStates::Version).add(1))
            .and_where(Expr::col(SagaStates::CorrelationId).eq(state.correlation_id.to_string()))
            .and_where(Expr::col(SagaStates::StateType).eq(state.state_type.as_str()))
            .and_where(Expr::col(SagaStates::Version).eq(state.version))
            .build_sqlx(SqliteQueryBuilder);

        let updated = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if updated.rows_affected() == 1 {
            state.version += 1;
            state.updated_time = now;
            return Ok(true);
        }

        let (sql, values) = Query::insert()
            .into_table(SagaStates::Table)
            .columns([
                SagaStates::CorrelationId,
                SagaStates::StateType,
                SagaStates::StateData,
                SagaStates::ConversationId,
                SagaStates::UpdatedTime,
                SagaStates::Version,
                SagaStates::HandledMessages,
            ])
            .values([
                state.correlation_id.to_string().into(),
                state.state_type.clone().into(),
                data.into(),
                conversation.into(),
                timestamp(now).into(),
                1i64.into(),
                handled.into(),
            ])?
            .on_conflict(
                OnConflict::columns([SagaStates::CorrelationId, SagaStates::StateType])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let inserted = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if inserted.rows_affected() == 1 {
            state.version = 1;
            state.updated_time = now;
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, correlation_id: Uuid, state_type: &str) -> Result<()> {
        let (sql, values) = Query::delete()
            .from_table(SagaStates::Table)
            .and_where(Expr::col(SagaStates::CorrelationId).eq(correlation_id.to_string()))
            .and_where(Expr::col(SagaStates::StateType).eq(state_type))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_if_version(
        &self,
        correlation_id: Uuid,
        state_type: &str,
        version: i64,
    ) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(SagaStates::Table)
            .and_where(Expr::col(SagaStates::CorrelationId).eq(correlation_id.to_string()))
            .and_where(Expr::col(SagaStates::StateType).eq(state_type))
            .and_where(Expr::col(SagaStates::Version).eq(version))
            .build_sqlx(SqliteQueryBuilder);

        let deleted = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(deleted.rows_affected() == 1)
    }
}
