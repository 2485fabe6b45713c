//! Embedding provider abstraction and the Gemini implementation.
//!
//! The rest of the crate only knows the [`EmbeddingModel`] trait; tests
//! substitute deterministic mocks. Provider failures propagate as
//! [`AppError::Provider`]; retry policy, if any, belongs to callers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::errors::AppError;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Produces embedding vectors for text.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    /// Embed a batch, order-preserving: one vector per input text.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// Cosine similarity between two vectors. Zero-magnitude input scores 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini `text-embedding-004` client over reqwest.
pub struct GeminiEmbeddings {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiEmbeddings {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: GEMINI_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Point the client at a different API base. Used by tests to target a
    /// local mock server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/models/{}:{verb}", self.base_url, self.model)
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::provider(format!(
                "embedding API returned {status}: {detail}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl EmbeddingModel for GeminiEmbeddings {
    #[instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let body = json!({
            "content": { "parts": [{ "text": text }] }
        });

        let response = self.post(&self.endpoint("embedContent"), body).await?;
        let parsed: EmbedContentResponse = response
            .json()
            .await
            .map_err(|err| AppError::provider(format!("malformed embedding response: {err}")))?;

        debug!(dims = parsed.embedding.values.len(), "embedded query text");
        Ok(parsed.embedding.values)
    }

    #[instrument(skip(self, texts), fields(model = %self.model, batch = texts.len()))]
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<_> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();

        let response = self
            .post(
                &self.endpoint("batchEmbedContents"),
                json!({ "requests": requests }),
            )
            .await?;
        let parsed: BatchEmbedResponse = response
            .json()
            .await
            .map_err(|err| AppError::provider(format!("malformed embedding response: {err}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(AppError::provider(format!(
                "embedding batch size mismatch: sent {}, received {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}
