//! Knowledge sources searched by the `retrieve` unit.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::knowledge::TextUnit;
use crate::error::ExternalCallError;
use crate::rag::ranking::{Scored, SimilarityRanker};

/// Query-time access to stored text units.
#[async_trait]
pub trait KnowledgeSource: Send + Sync + std::fmt::Debug {
    /// Best `top_k` units for `query`, best first, optionally within one collection.
    async fn search(
        &self,
        collection: Option<&str>,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Scored<TextUnit>>, ExternalCallError>;

    /// All units a set of ids refers to, in the given order; unknown ids are skipped.
    async fn units_by_id(&self, ids: &[String]) -> Result<Vec<TextUnit>, ExternalCallError>;
}

/// Units held in memory, ranked with a [`SimilarityRanker`] on every search.
#[derive(Debug, Clone)]
pub struct InMemoryKnowledge {
    units: Vec<TextUnit>,
    ranker: SimilarityRanker,
}

impl InMemoryKnowledge {
    pub fn new(units: Vec<TextUnit>, ranker: SimilarityRanker) -> Self {
        Self { units, ranker }
    }

    pub fn units(&self) -> &[TextUnit] {
        &self.units
    }
}

#[async_trait]
impl KnowledgeSource for InMemoryKnowledge {
    async fn search(
        &self,
        collection: Option<&str>,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Scored<TextUnit>>, ExternalCallError> {
        let candidates: Vec<TextUnit> = self
            .units
            .iter()
            .filter(|u| collection.is_none_or(|c| u.source_collection_id == c))
            .filter(|u| u.has_embedding())
            .cloned()
            .collect();
        let mut ranked = self.ranker.rank(query, candidates).await?;
        ranked.truncate(top_k);
        debug!(collection, results = ranked.len(), "In-memory search");
        Ok(ranked)
    }

    async fn units_by_id(&self, ids: &[String]) -> Result<Vec<TextUnit>, ExternalCallError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.units.iter().find(|u| &u.id == id).cloned())
            .collect())
    }
}
