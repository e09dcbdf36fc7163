//! Document ingestion: chunk, wrap into text units, attach embeddings.

use futures::StreamExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::knowledge::{SourceDocument, TextUnit};
use crate::error::ExternalCallError;
use crate::rag::chunking::Chunker;
use crate::rag::embedding::EmbeddingAdapter;

/// Failure ingesting one document. Sibling documents are unaffected.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("chunking `{document}` failed: {reason}")]
    Chunking { document: String, reason: String },
    #[error("embedding `{document}` failed: {source}")]
    Embedding {
        document: String,
        #[source]
        source: ExternalCallError,
    },
}

/// Chunks documents and (optionally) embeds the resulting units.
#[derive(Debug, Clone)]
pub struct IngestPipeline {
    chunker: Chunker,
    embeddings: Option<EmbeddingAdapter>,
    concurrency: usize,
}

impl IngestPipeline {
    pub fn new(chunker: Chunker, embeddings: Option<EmbeddingAdapter>, concurrency: usize) -> Self {
        Self {
            chunker,
            embeddings,
            concurrency: concurrency.max(1),
        }
    }

    /// Ingest one document into units of its collection, in chunk order.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError`] when chunking panics or embedding fails.
    pub async fn ingest(&self, document: SourceDocument) -> Result<Vec<TextUnit>, IngestError> {
        let label = document
            .name
            .clone()
            .unwrap_or_else(|| document.collection_id.clone());
        let chunker = self.chunker.clone();
        let SourceDocument {
            collection_id, text, ..
        } = document;

        let chunks = tokio::task::spawn_blocking(move || chunker.chunk(&text))
            .await
            .map_err(|e| IngestError::Chunking {
                document: label.clone(),
                reason: e.to_string(),
            })?;

        let mut units: Vec<TextUnit> = chunks
            .into_iter()
            .map(|content| TextUnit::new(collection_id.clone(), content))
            .collect();

        if let Some(embeddings) = &self.embeddings {
            embeddings
                .embed_units(&mut units)
                .await
                .map_err(|source| IngestError::Embedding {
                    document: label.clone(),
                    source,
                })?;
        }

        info!(document = %label, chunk_count = units.len(), "Document ingested");
        Ok(units)
    }

    /// Ingest many documents concurrently.
    ///
    /// Results are returned in input order, one per document; a failed
    /// document does not abort the others.
    pub async fn ingest_batch(&self, documents: Vec<SourceDocument>) -> Vec<Result<Vec<TextUnit>, IngestError>> {
        let results: Vec<_> = futures::stream::iter(documents)
            .map(|doc| self.ingest(doc))
            .buffered(self.concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "Some documents failed to ingest");
        }
        results
    }
}
