//! SQLite persistence: conversation sessions and retrieval context.
//!
//! Both stores share one pool. The schema is created idempotently at
//! startup; keyword search runs over an FTS5 mirror of the context
//! chunks, kept in sync at ingest time.

pub mod context;
pub mod sessions;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::errors::AppError;

/// Open (creating if necessary) the database at `database_url`.
pub async fn connect(database_url: &str) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|err| AppError::Persistence(format!("invalid database URL: {err}")))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    info!(%database_url, "database connected");
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps every query on
/// the same in-memory database.
pub async fn memory_pool() -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|err| AppError::Persistence(format!("invalid database URL: {err}")))?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create every table and index the service needs.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            session_id TEXT PRIMARY KEY,
            client_id  TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            is_active  INTEGER NOT NULL DEFAULT 1,
            metadata   TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_messages (
            id         TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES chat_sessions(session_id) ON DELETE CASCADE,
            seq        INTEGER NOT NULL,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL,
            metadata   TEXT NOT NULL DEFAULT '{}',
            UNIQUE (session_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_session \
         ON chat_messages (session_id, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_sessions_client \
         ON chat_sessions (client_id, updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_chunks (
            id         TEXT PRIMARY KEY,
            content    TEXT NOT NULL,
            embedding  TEXT NOT NULL,
            section    TEXT,
            subsection TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS context_chunks_fts USING fts5(
            chunk_id UNINDEXED,
            content,
            section,
            subsection
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
