//! Context retrieval: keyword candidates re-ranked by embedding similarity.
//!
//! Candidate selection is lexical (FTS over the chunk store); the final
//! ordering comes from cosine similarity between the query embedding and
//! each candidate's stored embedding. Retrieval failures degrade to "no
//! context" rather than failing the chat turn.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::config::RetrievalSettings;
use crate::embeddings::{cosine_similarity, EmbeddingModel};
use crate::errors::AppError;
use crate::governor::ToolUsageGovernor;
use crate::llm::{ToolRunner, ToolSpec};
use crate::store::context::ContextStore;

/// Shown to the model when retrieval produces nothing usable.
pub const NO_CONTEXT_MESSAGE: &str =
    "No relevant context information found for this query.";

/// Name of the retrieval tool exposed to the model.
pub const CONTEXT_TOOL: &str = "get_context";

/// A chunk scored against the query, relevance in [0, 1] rounded to
/// two decimals.
#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub content: String,
    pub relevance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Clone)]
pub struct Retriever {
    store: ContextStore,
    embedder: Arc<dyn EmbeddingModel>,
    keyword_limit: i64,
    top_k: usize,
}

impl Retriever {
    #[must_use]
    pub fn new(
        store: ContextStore,
        embedder: Arc<dyn EmbeddingModel>,
        settings: &RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            keyword_limit: settings.keyword_limit,
            top_k: settings.top_k,
        }
    }

    /// Best chunks for `query`. `max_results` is clamped to 1..=5 around
    /// the configured default.
    #[instrument(skip(self))]
    pub async fn retrieve(
        &self,
        query: &str,
        max_results: Option<usize>,
    ) -> Result<Vec<RankedChunk>, AppError> {
        let wanted = max_results.unwrap_or(self.top_k).clamp(1, 5);

        let candidates = match self.store.keyword_search(query, self.keyword_limit).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "keyword search failed, answering without context");
                return Ok(Vec::new());
            }
        };
        if candidates.is_empty() {
            debug!("no keyword candidates for query");
            return Ok(Vec::new());
        }

        let query_embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "query embedding failed, answering without context");
                return Ok(Vec::new());
            }
        };

        let mut ranked: Vec<RankedChunk> = candidates
            .into_iter()
            .map(|chunk| {
                let score = cosine_similarity(&query_embedding, &chunk.embedding);
                RankedChunk {
                    content: chunk.content,
                    relevance: (score * 100.0).round() / 100.0,
                    section: chunk.section,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(wanted);

        debug!(returned = ranked.len(), "retrieval complete");
        Ok(ranked)
    }
}

/// Declaration of the retrieval tool for function calling.
#[must_use]
pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: CONTEXT_TOOL.to_string(),
        description: "Search stored portfolio context for information relevant to the \
                      visitor's question."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to search the stored context for."
                },
                "max_results": {
                    "type": "integer",
                    "description": "How many chunks to return (1-5)."
                }
            },
            "required": ["query"]
        }),
    }
}

/// Bridges the model's tool calls to retrieval, under the per-session
/// usage budget: once the governor says no, the tool simply stops being
/// offered.
pub struct ContextToolRunner {
    retriever: Retriever,
    governor: Arc<ToolUsageGovernor>,
    session_id: String,
}

impl ContextToolRunner {
    #[must_use]
    pub fn new(
        retriever: Retriever,
        governor: Arc<ToolUsageGovernor>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            governor,
            session_id: session_id.into(),
        }
    }
}

#[async_trait::async_trait]
impl ToolRunner for ContextToolRunner {
    fn available(&self) -> Vec<ToolSpec> {
        if self.governor.can_use(&self.session_id, CONTEXT_TOOL) {
            vec![tool_spec()]
        } else {
            debug!(session_id = %self.session_id, "tool budget exhausted, withholding tool");
            Vec::new()
        }
    }

    async fn run(&self, name: &str, args: Value) -> Result<Value, AppError> {
        if name != CONTEXT_TOOL {
            return Err(AppError::validation(format!("unknown tool {name:?}")));
        }
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::validation("get_context requires a query"))?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        self.governor.record_use(&self.session_id, CONTEXT_TOOL);
        let chunks = self.retriever.retrieve(query, max_results).await?;

        if chunks.is_empty() {
            return Ok(json!({
                "success": true,
                "message": NO_CONTEXT_MESSAGE,
                "results": [],
            }));
        }
        Ok(json!({
            "success": true,
            "results": chunks
                .iter()
                .map(|chunk| {
                    json!({
                        "content": chunk.content,
                        "relevance_score": chunk.relevance,
                        "source": chunk.section,
                    })
                })
                .collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GovernorSettings;
    use crate::store::context::NewChunk;
    use crate::store::{init_schema, memory_pool};
    use chrono::{TimeZone, Utc};

    struct FixedEmbedder(Vec<f32>);

    #[async_trait::async_trait]
    impl EmbeddingModel for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(self.0.clone())
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingModel for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Err(AppError::provider("embedding backend down"))
        }

        async fn embed_many(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Err(AppError::provider("embedding backend down"))
        }
    }

    async fn seeded_retriever(embedder: Arc<dyn EmbeddingModel>) -> Retriever {
        let pool = memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let store = ContextStore::new(pool);
        store
            .ingest(&[
                NewChunk {
                    content: "Led the CRM project rewrite.".into(),
                    embedding: vec![1.0, 0.0],
                    section: Some("Projects".into()),
                    subsection: None,
                },
                NewChunk {
                    content: "CRM migrations for enterprise clients.".into(),
                    embedding: vec![0.6, 0.8],
                    section: Some("Projects".into()),
                    subsection: None,
                },
                NewChunk {
                    content: "CRM support rotations.".into(),
                    embedding: vec![0.0, 1.0],
                    section: Some("Experience".into()),
                    subsection: None,
                },
            ])
            .await
            .unwrap();
        Retriever::new(
            store,
            embedder,
            &RetrievalSettings {
                keyword_limit: 10,
                top_k: 3,
            },
        )
    }

    #[tokio::test]
    async fn ranks_by_cosine_similarity() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let ranked = retriever.retrieve("CRM", None).await.unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].content, "Led the CRM project rewrite.");
        assert_eq!(ranked[0].relevance, 1.0);
        assert_eq!(ranked[1].relevance, 0.6);
        assert_eq!(ranked[2].relevance, 0.0);
    }

    #[tokio::test]
    async fn max_results_is_clamped() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let ranked = retriever.retrieve("CRM", Some(99)).await.unwrap();
        assert_eq!(ranked.len(), 3); // clamp to 5, only 3 candidates exist
        let ranked = retriever.retrieve("CRM", Some(0)).await.unwrap();
        assert_eq!(ranked.len(), 1);
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_no_context() {
        let retriever = seeded_retriever(Arc::new(FailingEmbedder)).await;
        let ranked = retriever.retrieve("CRM", None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn no_candidates_yields_no_context() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let ranked = retriever.retrieve("zeppelin", None).await.unwrap();
        assert!(ranked.is_empty());
    }

    fn governor() -> Arc<ToolUsageGovernor> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        Arc::new(ToolUsageGovernor::new(
            &GovernorSettings::default(),
            clock,
        ))
    }

    #[tokio::test]
    async fn runner_withholds_tool_when_budget_spent() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let governor = governor();
        let runner = ContextToolRunner::new(retriever, governor.clone(), "s1");

        assert_eq!(runner.available().len(), 1);
        for _ in 0..3 {
            runner
                .run(CONTEXT_TOOL, json!({"query": "CRM"}))
                .await
                .unwrap();
        }
        assert!(runner.available().is_empty());
    }

    #[tokio::test]
    async fn runner_reports_no_context_sentinel() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let runner = ContextToolRunner::new(retriever, governor(), "s1");
        let out = runner
            .run(CONTEXT_TOOL, json!({"query": "zeppelin"}))
            .await
            .unwrap();
        assert_eq!(out["message"], NO_CONTEXT_MESSAGE);
        assert!(out["results"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn runner_rejects_unknown_tool_and_missing_query() {
        let retriever = seeded_retriever(Arc::new(FixedEmbedder(vec![1.0, 0.0]))).await;
        let runner = ContextToolRunner::new(retriever, governor(), "s1");
        assert!(runner.run("bogus", json!({})).await.is_err());
        assert!(runner.run(CONTEXT_TOOL, json!({})).await.is_err());
    }
}
