//! Embedding store adapter.
//!
//! Attaches vectors to [`TextUnit`]s through an [`Embedder`] and moves vectors
//! across the persistence boundary as JSON arrays of floats. This is not a
//! vector database: storage and indexing belong to the caller.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::knowledge::{AttachOutcome, TextUnit};
use crate::error::ExternalCallError;
use crate::llm::Embedder;
use crate::runtime::retry::RetryPolicy;

const COLLABORATOR: &str = "embedder";

/// Counts reported by [`EmbeddingAdapter::embed_units`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    /// Units that received a vector in this call.
    pub attached: usize,
    /// Units that already had one.
    pub skipped: usize,
}

/// Wraps an [`Embedder`] with batching, retry and dimension checks.
#[derive(Debug, Clone)]
pub struct EmbeddingAdapter {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl EmbeddingAdapter {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed a batch of texts, retrying retryable failures.
    ///
    /// # Errors
    ///
    /// Fails when the embedder keeps failing, returns the wrong number of
    /// vectors, or returns vectors of inconsistent dimension.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalCallError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self
                .retry
                .run(COLLABORATOR, || self.embedder.embed(batch.to_vec()))
                .await?;
            if vectors.len() != batch.len() {
                return Err(ExternalCallError::fatal(
                    COLLABORATOR,
                    format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                ));
            }
            out.extend(vectors);
        }
        self.check_dimensions(&out)?;
        Ok(out)
    }

    /// Embed a single query string.
    ///
    /// # Errors
    ///
    /// See [`Self::embed_texts`].
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, ExternalCallError> {
        self.embed_texts(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExternalCallError::fatal(COLLABORATOR, "no vector for query"))
    }

    /// Attach vectors to the units that do not have one yet.
    ///
    /// Units that already carry a vector are left untouched, so re-running
    /// after a partial failure only embeds what is still missing.
    ///
    /// # Errors
    ///
    /// See [`Self::embed_texts`]. Units embedded in earlier batches keep their vectors.
    pub async fn embed_units(&self, units: &mut [TextUnit]) -> Result<EmbedReport, ExternalCallError> {
        let mut report = EmbedReport::default();
        let pending: Vec<usize> = units
            .iter()
            .enumerate()
            .filter(|(_, u)| !u.has_embedding())
            .map(|(i, _)| i)
            .collect();
        report.skipped = units.len() - pending.len();

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|&i| units[i].content.clone()).collect();
            let vectors = self.embed_texts(&texts).await?;
            for (&i, vector) in batch.iter().zip(vectors) {
                if units[i].attach_embedding(vector) == AttachOutcome::Attached {
                    report.attached += 1;
                }
            }
        }

        debug!(
            attached = report.attached,
            skipped = report.skipped,
            "Embeddings attached"
        );
        Ok(report)
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<(), ExternalCallError> {
        let expected = self
            .embedder
            .dimensions()
            .or_else(|| vectors.first().map(Vec::len));
        let Some(expected) = expected else {
            return Ok(());
        };
        match vectors.iter().find(|v| v.len() != expected) {
            Some(bad) => Err(ExternalCallError::fatal(
                COLLABORATOR,
                format!("expected dimension {expected}, got {}", bad.len()),
            )),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Persistence boundary
// =============================================================================

/// Serialize a vector as a JSON array of floats.
///
/// # Errors
///
/// Fails for non-finite components, which JSON cannot represent.
pub fn encode_vector(vector: &[f32]) -> Result<String, serde_json::Error> {
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(serde::ser::Error::custom("vector contains non-finite values"));
    }
    serde_json::to_string(vector)
}

/// Parse a JSON array of floats.
///
/// # Errors
///
/// Fails when the input is not an array of numbers.
pub fn decode_vector(raw: &str) -> Result<Vec<f32>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Rehydrate a stored unit with its serialized vector.
///
/// # Errors
///
/// See [`decode_vector`].
pub fn restore_unit(unit: TextUnit, raw_vector: &str) -> Result<TextUnit, serde_json::Error> {
    let vector = decode_vector(raw_vector)?;
    info!(unit = %unit.id, dimensions = vector.len(), "Restored stored embedding");
    Ok(unit.with_embedding(vector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct LengthEmbedder {
        calls: AtomicUsize,
        texts_seen: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            #[allow(clippy::cast_precision_loss)]
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[derive(Debug)]
    struct RaggedEmbedder;

    #[async_trait]
    impl Embedder for RaggedEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError> {
            Ok(texts.iter().map(|t| vec![0.0; t.len()]).collect())
        }
    }

    #[tokio::test]
    async fn test_embed_units_only_missing() {
        let embedder = Arc::new(LengthEmbedder::default());
        let adapter = EmbeddingAdapter::new(Arc::clone(&embedder) as Arc<dyn Embedder>, 2, RetryPolicy::none());
        let mut units = vec![
            TextUnit::with_id("a", "kb", "one").with_embedding(vec![9.0, 9.0]),
            TextUnit::with_id("b", "kb", "three"),
            TextUnit::with_id("c", "kb", "ab"),
            TextUnit::with_id("d", "kb", "x"),
        ];

        let report = adapter.embed_units(&mut units).await.unwrap();
        assert_eq!(report, EmbedReport { attached: 3, skipped: 1 });
        assert_eq!(units[0].embedding(), Some(&[9.0, 9.0][..]));
        assert_eq!(units[1].embedding(), Some(&[5.0, 1.0][..]));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        // Second pass is a no-op.
        let report = adapter.embed_units(&mut units).await.unwrap();
        assert_eq!(report, EmbedReport { attached: 0, skipped: 4 });
        assert_eq!(embedder.texts_seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let adapter = EmbeddingAdapter::new(Arc::new(RaggedEmbedder), 8, RetryPolicy::none());
        let err = adapter
            .embed_texts(&["ab".to_string(), "abc".to_string()])
            .await
            .unwrap_err();
        assert!(err.message.contains("dimension"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_vector_json_boundary() {
        let raw = encode_vector(&[0.25, -1.0, 3.5]).unwrap();
        assert_eq!(raw, "[0.25,-1.0,3.5]");
        assert_eq!(decode_vector(&raw).unwrap(), vec![0.25, -1.0, 3.5]);
        assert!(decode_vector("[\"a\"]").is_err());
        assert!(encode_vector(&[f32::NAN]).is_err());

        let unit = restore_unit(TextUnit::with_id("u", "kb", "t"), "[1, 2]").unwrap();
        assert_eq!(unit.embedding(), Some(&[1.0, 2.0][..]));
    }
}
