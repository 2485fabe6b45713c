//! Context chunk storage and keyword candidate search.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::errors::AppError;

/// A chunk ready to be stored, embedding already computed.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    pub section: Option<String>,
    pub subsection: Option<String>,
}

/// A chunk as read back from the database.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub section: Option<String>,
    pub subsection: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Store for retrieval context, backed by a chunk table plus an FTS5
/// mirror used for keyword candidate selection.
#[derive(Clone)]
pub struct ContextStore {
    pool: SqlitePool,
}

impl ContextStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a batch of chunks. Returns the number stored.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn ingest(&self, chunks: &[NewChunk]) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for chunk in chunks {
            let id = Uuid::new_v4().to_string();
            let embedding = serde_json::to_string(&chunk.embedding)
                .map_err(|err| AppError::Persistence(format!("embedding encode: {err}")))?;

            sqlx::query(
                "INSERT INTO context_chunks (id, content, embedding, section, subsection, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&chunk.content)
            .bind(&embedding)
            .bind(&chunk.section)
            .bind(&chunk.subsection)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO context_chunks_fts (chunk_id, content, section, subsection) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&chunk.content)
            .bind(chunk.section.as_deref().unwrap_or(""))
            .bind(chunk.subsection.as_deref().unwrap_or(""))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(stored = chunks.len(), "context chunks ingested");
        Ok(chunks.len())
    }

    /// Keyword candidates for `query`, best match first.
    ///
    /// The query text is reduced to alphanumeric terms OR-ed together;
    /// a query with no usable terms yields no candidates.
    #[instrument(skip(self))]
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: i64,
    ) -> Result<Vec<StoredChunk>, AppError> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT c.id, c.content, c.embedding, c.section, c.subsection, c.created_at \
             FROM context_chunks_fts f \
             JOIN context_chunks c ON c.id = f.chunk_id \
             WHERE context_chunks_fts MATCH ? \
             ORDER BY rank \
             LIMIT ?",
        )
        .bind(&match_expr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_chunk).collect()
    }

    /// Total stored chunks.
    pub async fn count(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM context_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> Result<StoredChunk, AppError> {
    let embedding_json: String = row.try_get("embedding")?;
    let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
        .map_err(|err| AppError::Persistence(format!("embedding decode: {err}")))?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|err| AppError::Persistence(format!("timestamp decode: {err}")))?
        .with_timezone(&Utc);

    Ok(StoredChunk {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        embedding,
        section: row.try_get("section")?,
        subsection: row.try_get("subsection")?,
        created_at,
    })
}

/// Build a safe FTS5 MATCH expression: each alphanumeric term quoted,
/// all terms OR-ed. Returns `None` when nothing searchable remains.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{init_schema, memory_pool};

    async fn seeded_store() -> ContextStore {
        let pool = memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let store = ContextStore::new(pool);
        store
            .ingest(&[
                NewChunk {
                    content: "Built a CRM system for a logistics company.".into(),
                    embedding: vec![1.0, 0.0],
                    section: Some("Projects".into()),
                    subsection: None,
                },
                NewChunk {
                    content: "Ten years of experience with distributed systems.".into(),
                    embedding: vec![0.0, 1.0],
                    section: Some("Experience".into()),
                    subsection: None,
                },
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn keyword_search_finds_matching_chunks() {
        let store = seeded_store().await;
        let hits = store.keyword_search("CRM logistics", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("CRM"));
        assert_eq!(hits[0].embedding, vec![1.0, 0.0]);
        assert_eq!(hits[0].section.as_deref(), Some("Projects"));
    }

    #[tokio::test]
    async fn terms_are_or_combined() {
        let store = seeded_store().await;
        let hits = store.keyword_search("CRM experience", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn unsearchable_query_yields_nothing() {
        let store = seeded_store().await;
        let hits = store.keyword_search("!!! ???", 10).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(fts_match_expr("   "), None);
    }

    #[tokio::test]
    async fn limit_is_respected() {
        let store = seeded_store().await;
        let hits = store.keyword_search("systems", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn count_reflects_ingested_chunks() {
        let store = seeded_store().await;
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[test]
    fn match_expr_quotes_terms() {
        assert_eq!(
            fts_match_expr("what's the CRM?").as_deref(),
            Some("\"what\" OR \"s\" OR \"the\" OR \"CRM\"")
        );
    }
}
