//! Conversation sessions and their messages.
//!
//! Message ordering is a per-session `seq` column assigned atomically by
//! the insert itself (`COALESCE(MAX(seq), 0) + 1` in a single statement),
//! so concurrent writers cannot produce duplicate positions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(AppError::Persistence(format!("unknown role {other:?}"))),
        }
    }
}

/// Request-side details attached to a session when it is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// Generation details recorded alongside assistant messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: GenerationMetadata,
}

/// Aggregate counters for the whole conversation store.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub active_last_24h: i64,
    pub active_last_7d: i64,
    pub average_messages_per_session: f64,
    pub oldest_session: Option<DateTime<Utc>>,
    pub newest_session: Option<DateTime<Utc>>,
}

/// Per-client activity summary, most recently active first.
#[derive(Debug, Clone, Serialize)]
pub struct TopClient {
    pub client_id: String,
    pub total_messages: i64,
    pub session_count: i64,
    pub last_active: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Create a fresh session for `client_id` and return its id.
    #[instrument(skip(self, metadata))]
    pub async fn create_session(
        &self,
        client_id: &str,
        metadata: &SessionMetadata,
    ) -> Result<String, AppError> {
        let session_id = Uuid::new_v4().to_string();
        let now = self.clock.now().to_rfc3339();
        let metadata = serde_json::to_string(metadata)
            .map_err(|err| AppError::Persistence(format!("metadata encode: {err}")))?;

        sqlx::query(
            "INSERT INTO chat_sessions (session_id, client_id, created_at, updated_at, is_active, metadata) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(&session_id)
        .bind(client_id)
        .bind(&now)
        .bind(&now)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        debug!(%session_id, %client_id, "session created");
        Ok(session_id)
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM chat_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Append a message to an existing session.
    #[instrument(skip(self, message), fields(role = message.role.as_str()))]
    pub async fn add_message(
        &self,
        session_id: &str,
        message: &NewMessage,
    ) -> Result<StoredMessage, AppError> {
        if message.content.trim().is_empty() {
            return Err(AppError::validation("message content must not be empty"));
        }
        if !self.session_exists(session_id).await? {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let metadata = serde_json::to_string(&message.metadata)
            .map_err(|err| AppError::Persistence(format!("metadata encode: {err}")))?;

        // Sequence assignment and insert in one statement keeps positions
        // unique under concurrent writers.
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, seq, role, content, created_at, metadata) \
             SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ? \
             FROM chat_messages WHERE session_id = ?",
        )
        .bind(&id)
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(now.to_rfc3339())
        .bind(&metadata)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE session_id = ?")
            .bind(now.to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT seq FROM chat_messages WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        let seq: i64 = row.try_get("seq")?;

        Ok(StoredMessage {
            id,
            session_id: session_id.to_string(),
            seq,
            role: message.role,
            content: message.content.clone(),
            created_at: now,
            metadata: message.metadata.clone(),
        })
    }

    /// The last `limit` messages of a session in conversation order.
    #[instrument(skip(self))]
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, AppError> {
        let rows = sqlx::query(
            "SELECT id, session_id, seq, role, content, created_at, metadata \
             FROM chat_messages WHERE session_id = ? \
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Mark a session inactive. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn mark_inactive(&self, session_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET is_active = 0, updated_at = ? \
             WHERE session_id = ? AND is_active = 1",
        )
        .bind(self.clock.now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete inactive sessions untouched for more than `days` days.
    /// Messages follow via the cascading foreign key.
    #[instrument(skip(self))]
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64, AppError> {
        let cutoff = (self.clock.now() - chrono::Duration::days(days)).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM chat_sessions WHERE is_active = 0 AND updated_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(removed = result.rows_affected(), "old sessions cleaned up");
        }
        Ok(result.rows_affected())
    }

    /// Aggregate counters across all sessions.
    pub async fn stats(&self) -> Result<SessionStats, AppError> {
        let now = self.clock.now();
        let day_ago = (now - chrono::Duration::hours(24)).to_rfc3339();
        let week_ago = (now - chrono::Duration::days(7)).to_rfc3339();

        let row = sqlx::query(
            "SELECT \
                (SELECT COUNT(*) FROM chat_sessions) AS total_sessions, \
                (SELECT COUNT(*) FROM chat_messages) AS total_messages, \
                (SELECT COUNT(*) FROM chat_sessions WHERE updated_at >= ?) AS active_last_24h, \
                (SELECT COUNT(*) FROM chat_sessions WHERE updated_at >= ?) AS active_last_7d, \
                (SELECT MIN(created_at) FROM chat_sessions) AS oldest_session, \
                (SELECT MAX(created_at) FROM chat_sessions) AS newest_session",
        )
        .bind(&day_ago)
        .bind(&week_ago)
        .fetch_one(&self.pool)
        .await?;

        let total_sessions: i64 = row.try_get("total_sessions")?;
        let total_messages: i64 = row.try_get("total_messages")?;
        let average = if total_sessions == 0 {
            0.0
        } else {
            let raw = total_messages as f64 / total_sessions as f64;
            (raw * 100.0).round() / 100.0
        };

        Ok(SessionStats {
            total_sessions,
            total_messages,
            active_last_24h: row.try_get("active_last_24h")?,
            active_last_7d: row.try_get("active_last_7d")?,
            average_messages_per_session: average,
            oldest_session: parse_optional_ts(row.try_get("oldest_session")?)?,
            newest_session: parse_optional_ts(row.try_get("newest_session")?)?,
        })
    }

    /// The `limit` most active clients by message volume.
    pub async fn top_clients(&self, limit: i64) -> Result<Vec<TopClient>, AppError> {
        let rows = sqlx::query(
            "SELECT s.client_id, \
                    COUNT(m.id) AS total_messages, \
                    COUNT(DISTINCT s.session_id) AS session_count, \
                    MAX(s.updated_at) AS last_active \
             FROM chat_sessions s \
             LEFT JOIN chat_messages m ON m.session_id = s.session_id \
             GROUP BY s.client_id \
             ORDER BY total_messages DESC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let last_active: String = row.try_get("last_active")?;
                Ok(TopClient {
                    client_id: row.try_get("client_id")?,
                    total_messages: row.try_get("total_messages")?,
                    session_count: row.try_get("session_count")?,
                    last_active: parse_ts(&last_active)?,
                })
            })
            .collect()
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AppError::Persistence(format!("timestamp decode: {err}")))
}

fn parse_optional_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    value.as_deref().map(parse_ts).transpose()
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage, AppError> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        seq: row.try_get("seq")?,
        role: MessageRole::parse(&role)?,
        content: row.try_get("content")?,
        created_at: parse_ts(&created_at)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|err| AppError::Persistence(format!("metadata decode: {err}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{init_schema, memory_pool};
    use chrono::TimeZone;

    async fn store_with_clock() -> (SessionStore, Arc<ManualClock>) {
        let pool = memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        (SessionStore::new(pool, clock.clone()), clock)
    }

    fn user_msg(content: &str) -> NewMessage {
        NewMessage {
            role: MessageRole::User,
            content: content.to_string(),
            metadata: GenerationMetadata::default(),
        }
    }

    #[tokio::test]
    async fn messages_keep_conversation_order() {
        let (store, _) = store_with_clock().await;
        let session = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();

        for i in 1..=4 {
            store
                .add_message(&session, &user_msg(&format!("msg {i}")))
                .await
                .unwrap();
        }

        let recent = store.recent_messages(&session, 10).await.unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(
            recent.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(recent[0].content, "msg 1");
        assert_eq!(recent[3].content, "msg 4");
    }

    #[tokio::test]
    async fn recent_messages_window_takes_the_tail() {
        let (store, _) = store_with_clock().await;
        let session = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        for i in 1..=5 {
            store
                .add_message(&session, &user_msg(&format!("msg {i}")))
                .await
                .unwrap();
        }

        let tail = store.recent_messages(&session, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "msg 4");
        assert_eq!(tail[1].content, "msg 5");
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (store, _) = store_with_clock().await;
        let err = store
            .add_message("nope", &user_msg("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let (store, _) = store_with_clock().await;
        let session = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        let err = store
            .add_message(&session, &user_msg("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn mark_inactive_is_idempotent() {
        let (store, _) = store_with_clock().await;
        let session = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        assert!(store.mark_inactive(&session).await.unwrap());
        assert!(!store.mark_inactive(&session).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_only_removes_old_inactive_sessions() {
        let (store, clock) = store_with_clock().await;
        let stale = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        store.mark_inactive(&stale).await.unwrap();

        clock.advance(chrono::Duration::days(40));
        let fresh_inactive = store
            .create_session("client-b", &SessionMetadata::default())
            .await
            .unwrap();
        store.mark_inactive(&fresh_inactive).await.unwrap();
        let active = store
            .create_session("client-c", &SessionMetadata::default())
            .await
            .unwrap();

        let removed = store.cleanup_older_than(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.session_exists(&stale).await.unwrap());
        assert!(store.session_exists(&fresh_inactive).await.unwrap());
        assert!(store.session_exists(&active).await.unwrap());
    }

    #[tokio::test]
    async fn cascading_delete_removes_messages() {
        let (store, clock) = store_with_clock().await;
        let session = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        store.add_message(&session, &user_msg("hi")).await.unwrap();
        store.mark_inactive(&session).await.unwrap();

        clock.advance(chrono::Duration::days(31));
        store.cleanup_older_than(30).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.total_messages, 0);
    }

    #[tokio::test]
    async fn stats_and_top_clients() {
        let (store, clock) = store_with_clock().await;
        let a = store
            .create_session("client-a", &SessionMetadata::default())
            .await
            .unwrap();
        store.add_message(&a, &user_msg("one")).await.unwrap();
        store.add_message(&a, &user_msg("two")).await.unwrap();

        clock.advance(chrono::Duration::days(2));
        let b = store
            .create_session("client-b", &SessionMetadata::default())
            .await
            .unwrap();
        store.add_message(&b, &user_msg("three")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.active_last_24h, 1);
        assert_eq!(stats.active_last_7d, 2);
        assert_eq!(stats.average_messages_per_session, 1.5);
        assert!(stats.oldest_session.unwrap() < stats.newest_session.unwrap());

        let top = store.top_clients(5).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].client_id, "client-a");
        assert_eq!(top[0].total_messages, 2);
        assert_eq!(top[0].session_count, 1);
    }
}
