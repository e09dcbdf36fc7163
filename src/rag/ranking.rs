//! Similarity ranking.
//!
//! Scores candidates against a query vector with pairwise cosine similarity
//! and orders them by descending score. Ties keep their input order. Ranking
//! reads vectors only; truncation and thresholds are left to the caller.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::graph::Entity;
use crate::domain::knowledge::TextUnit;
use crate::error::ExternalCallError;
use crate::rag::embedding::EmbeddingAdapter;

// =============================================================================
// Candidates
// =============================================================================

/// Anything that can be ranked by its vector.
pub trait Embedded {
    fn vector(&self) -> Option<&[f32]>;
}

impl Embedded for TextUnit {
    fn vector(&self) -> Option<&[f32]> {
        self.embedding()
    }
}

impl Embedded for Entity {
    fn vector(&self) -> Option<&[f32]> {
        self.attribute_embedding.as_deref()
    }
}

/// A bare `{id, vector}` pair, as loaded from a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub vector: Vec<f32>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
        }
    }
}

impl Embedded for Candidate {
    fn vector(&self) -> Option<&[f32]> {
        Some(&self.vector)
    }
}

/// A candidate decorated with its query-scoped score.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub item: T,
    pub score: f32,
}

// =============================================================================
// Scoring
// =============================================================================

/// Cosine similarity without assuming normalized inputs.
///
/// Zero vectors, mismatched dimensions and non-finite results score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product / (norm_a * norm_b);
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Score and order candidates by descending similarity to `query`.
///
/// Candidates without a vector score 0. The sort is stable.
pub fn rank_by_vector<T: Embedded>(query: &[f32], candidates: Vec<T>) -> Vec<Scored<T>> {
    let mut scored: Vec<Scored<T>> = candidates
        .into_iter()
        .map(|item| {
            let score = item.vector().map_or(0.0, |v| cosine_similarity(query, v));
            Scored { item, score }
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

// =============================================================================
// Ranker
// =============================================================================

/// Ranks candidates against a textual query.
#[derive(Debug, Clone)]
pub struct SimilarityRanker {
    embeddings: EmbeddingAdapter,
    /// Candidate sets larger than this are scored on the blocking pool.
    blocking_threshold: usize,
}

impl SimilarityRanker {
    pub fn new(embeddings: EmbeddingAdapter, blocking_threshold: usize) -> Self {
        Self {
            embeddings,
            blocking_threshold,
        }
    }

    pub fn embeddings(&self) -> &EmbeddingAdapter {
        &self.embeddings
    }

    /// Embed `query` and rank `candidates` against it.
    ///
    /// An empty candidate set returns immediately without calling the embedder.
    ///
    /// # Errors
    ///
    /// Fails when the query cannot be embedded or the ranking task dies.
    pub async fn rank<T>(&self, query: &str, candidates: Vec<T>) -> Result<Vec<Scored<T>>, ExternalCallError>
    where
        T: Embedded + Send + 'static,
    {
        if candidates.is_empty() {
            debug!("No candidates to rank");
            return Ok(Vec::new());
        }
        let query_vector = self.embeddings.embed_query(query).await?;
        self.rank_vector(query_vector, candidates).await
    }

    /// Rank against an already-embedded query.
    ///
    /// # Errors
    ///
    /// A fatal `ranker` error when the blocking task panics or is cancelled.
    pub async fn rank_vector<T>(&self, query: Vec<f32>, candidates: Vec<T>) -> Result<Vec<Scored<T>>, ExternalCallError>
    where
        T: Embedded + Send + 'static,
    {
        let count = candidates.len();
        if count <= self.blocking_threshold {
            return Ok(rank_by_vector(&query, candidates));
        }

        debug!(count, "Ranking on blocking pool");
        tokio::task::spawn_blocking(move || rank_by_vector(&query, candidates))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Ranking task failed");
                ExternalCallError::fatal("ranker", e.to_string())
            })
    }

    /// Rank text units and fill their transient `similarity_score`.
    ///
    /// # Errors
    ///
    /// See [`Self::rank`].
    pub async fn rank_units(&self, query: &str, units: Vec<TextUnit>) -> Result<Vec<TextUnit>, ExternalCallError> {
        let ranked = self.rank(query, units).await?;
        Ok(ranked
            .into_iter()
            .map(|Scored { mut item, score }| {
                item.similarity_score = Some(score);
                item
            })
            .collect())
    }
}
