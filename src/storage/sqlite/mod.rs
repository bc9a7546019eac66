//! SQLite implementations of the delivery stores.
//!
//! Queries are built with sea-query and bound through sea-query-binder.
//! Timestamps are stored as fixed-precision RFC 3339 text so ordering and
//! range comparisons work on the raw column.

mod inbox;
mod outbox;
mod saga;
mod scheduled;
mod session;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

pub use inbox::SqliteInboxStore;
pub use outbox::SqliteOutboxStore;
pub use saga::SqliteSagaRepository;
pub use scheduled::SqliteScheduledMessageStore;
pub use session::{SqliteSessionFactory, SqliteStorageSession};

use super::{Result, StorageError, Stores};
use crate::message::Headers;

/// Open (creating if needed) the database at `path` and apply migrations.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Configuration(format!("cannot create '{}': {e}", parent.display()))
            })?;
        }
    }

    let pool = SqlitePool::connect(&format!("sqlite:{path}?mode=rwc")).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply the bundled schema migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations/sqlite").run(pool).await?;
    Ok(())
}

/// Every store over one pool.
pub fn stores(pool: SqlitePool) -> Stores {
    Stores {
        outbox: Arc::new(SqliteOutboxStore::new(pool.clone())),
        inbox: Arc::new(SqliteInboxStore::new(pool.clone())),
        scheduled: Arc::new(SqliteScheduledMessageStore::new(pool.clone())),
        sagas: Arc::new(SqliteSagaRepository::new(pool.clone())),
        sessions: Arc::new(SqliteSessionFactory::new(pool)),
    }
}

// ============================================================================
// Column encoding
// ============================================================================

pub(crate) fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{raw}: {e}")))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>> {
    Ok(raw.as_deref().map(Uuid::parse_str).transpose()?)
}

pub(crate) fn encode_headers(headers: &Headers) -> Result<String> {
    Ok(serde_json::to_string(headers)?)
}

pub(crate) fn decode_headers(raw: &str) -> Result<Headers> {
    Ok(serde_json::from_str(raw)?)
}
