//! Document ingestion: extract text, chunk it, embed it, store it.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::chunker::{sectioned_chunks, window_chunks};
use crate::config::ChunkingSettings;
use crate::embeddings::EmbeddingModel;
use crate::errors::AppError;
use crate::store::context::{ContextStore, NewChunk};

/// Pulls plain text out of an uploaded document.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String, AppError>;
}

/// PDF extraction via `pdf-extract`.
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, AppError> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|err| AppError::validation(format!("could not read PDF: {err}")))
    }
}

/// How an extracted document is split before embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingMode {
    /// Fixed-size overlapping windows.
    Windowed,
    /// Heading/paragraph-aware packing; detected headings become chunk
    /// section labels.
    Structured,
}

pub struct Ingestor {
    store: ContextStore,
    embedder: Arc<dyn EmbeddingModel>,
    extractor: Arc<dyn TextExtractor>,
    chunking: ChunkingSettings,
}

impl Ingestor {
    #[must_use]
    pub fn new(
        store: ContextStore,
        embedder: Arc<dyn EmbeddingModel>,
        extractor: Arc<dyn TextExtractor>,
        chunking: ChunkingSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            chunking,
        }
    }

    /// Ingest one document. Returns how many chunks were stored.
    ///
    /// In `Structured` mode the heading each chunk was found under becomes
    /// its section label; when the caller supplies a document-level
    /// `section`, that takes the section slot and detected headings land in
    /// `subsection` instead.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len(), mode = ?mode))]
    pub async fn ingest_document(
        &self,
        bytes: &[u8],
        mode: ChunkingMode,
        section: Option<String>,
    ) -> Result<usize, AppError> {
        let text = self.extractor.extract(bytes)?;
        if text.trim().is_empty() {
            return Err(AppError::validation("document contains no extractable text"));
        }

        // (content, detected heading) pairs; windowed chunks carry no label.
        let chunks: Vec<(String, Option<String>)> = match mode {
            ChunkingMode::Windowed => window_chunks(
                &text,
                self.chunking.window_size,
                self.chunking.window_overlap,
            )
            .into_iter()
            .map(|content| (content, None))
            .collect(),
            ChunkingMode::Structured => sectioned_chunks(&text, self.chunking.pack_budget)
                .into_iter()
                .map(|chunk| (chunk.content, chunk.heading))
                .collect(),
        };
        if chunks.is_empty() {
            return Err(AppError::validation("document produced no chunks"));
        }

        let contents: Vec<String> = chunks.iter().map(|(content, _)| content.clone()).collect();
        let embeddings = self.embedder.embed_many(&contents).await?;
        let new_chunks: Vec<NewChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|((content, heading), embedding)| {
                let (chunk_section, chunk_subsection) = match &section {
                    Some(document_section) => (Some(document_section.clone()), heading),
                    None => (heading, None),
                };
                NewChunk {
                    content,
                    embedding,
                    section: chunk_section,
                    subsection: chunk_subsection,
                }
            })
            .collect();

        let stored = self.store.ingest(&new_chunks).await?;
        info!(stored, "document ingested");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{init_schema, memory_pool};

    struct PlainText;

    impl TextExtractor for PlainText {
        fn extract(&self, bytes: &[u8]) -> Result<String, AppError> {
            String::from_utf8(bytes.to_vec())
                .map_err(|err| AppError::validation(format!("not UTF-8: {err}")))
        }
    }

    struct CountingEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingModel for CountingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.5, 0.5])
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.5, 0.5]).collect())
        }
    }

    async fn ingestor() -> (Ingestor, ContextStore) {
        let pool = memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let store = ContextStore::new(pool);
        let ingestor = Ingestor::new(
            store.clone(),
            Arc::new(CountingEmbedder),
            Arc::new(PlainText),
            ChunkingSettings {
                window_size: 40,
                window_overlap: 10,
                pack_budget: 80,
            },
        );
        (ingestor, store)
    }

    #[tokio::test]
    async fn windowed_ingestion_stores_chunks() {
        let (ingestor, store) = ingestor().await;
        let text = "Years of production experience across several teams and many projects, \
                    mostly backend services.";
        let stored = ingestor
            .ingest_document(text.as_bytes(), ChunkingMode::Windowed, None)
            .await
            .unwrap();
        assert!(stored > 1);
        assert_eq!(store.count().await.unwrap(), stored as i64);
    }

    #[tokio::test]
    async fn structured_ingestion_labels_chunks_with_detected_headings() {
        let (ingestor, store) = ingestor().await;
        let text = "Projects\n\nBuilt a CRM for a logistics company.\n\nExperience\n\nTen years of Rust.";
        let stored = ingestor
            .ingest_document(text.as_bytes(), ChunkingMode::Structured, None)
            .await
            .unwrap();
        assert_eq!(stored, 2);

        let hits = store.keyword_search("logistics", 10).await.unwrap();
        assert_eq!(hits[0].section.as_deref(), Some("Projects"));
        assert_eq!(hits[0].subsection, None);

        let hits = store.keyword_search("Rust", 10).await.unwrap();
        assert_eq!(hits[0].section.as_deref(), Some("Experience"));
    }

    #[tokio::test]
    async fn document_section_demotes_headings_to_subsections() {
        let (ingestor, store) = ingestor().await;
        let text = "Projects\n\nBuilt a CRM for a logistics company.";
        ingestor
            .ingest_document(
                text.as_bytes(),
                ChunkingMode::Structured,
                Some("resume".to_string()),
            )
            .await
            .unwrap();

        let hits = store.keyword_search("logistics", 10).await.unwrap();
        assert_eq!(hits[0].section.as_deref(), Some("resume"));
        assert_eq!(hits[0].subsection.as_deref(), Some("Projects"));
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let (ingestor, _) = ingestor().await;
        let err = ingestor
            .ingest_document(b"   \n  ", ChunkingMode::Windowed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
