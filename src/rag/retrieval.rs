//! Hybrid Retriever with Reciprocal Rank Fusion (RRF)
//!
//! Combines vector-ranked text units with units cited by graph entities.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::graph::Entity;
use crate::domain::knowledge::TextUnit;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for hybrid retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridRetrieverConfig {
    /// Weight for vector results (0.0 to 1.0)
    pub vector_weight: f32,
    /// Weight for graph results (0.0 to 1.0)
    pub graph_weight: f32,
    /// RRF constant k (typically 60)
    pub rrf_k: f32,
    /// Maximum results to return
    pub max_results: usize,
    /// Minimum fused score
    pub min_score: f32,
}

impl Default for HybridRetrieverConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            graph_weight: 0.3,
            rrf_k: 60.0,
            max_results: 10,
            min_score: 0.0,
        }
    }
}

// =============================================================================
// Retrieval Source
// =============================================================================

/// Which ranking(s) a fused unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalSource {
    Vector,
    Graph,
    Both,
}

/// A text unit with its fused score and source attribution.
#[derive(Debug, Clone)]
pub struct FusedUnit {
    pub unit: TextUnit,
    pub score: f32,
    pub vector_rank: Option<usize>,
    pub graph_rank: Option<usize>,
    pub source: RetrievalSource,
}

// =============================================================================
// Hybrid Retriever
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct HybridRetriever {
    config: HybridRetrieverConfig,
}

impl HybridRetriever {
    pub fn new(config: HybridRetrieverConfig) -> Self {
        Self { config }
    }

    /// Fuse two rankings of text units.
    ///
    /// Both inputs must already be ordered best-first. Equal fused scores keep
    /// first-seen order (vector list first), so the output is deterministic.
    pub fn fuse(&self, vector_results: Vec<TextUnit>, graph_results: Vec<TextUnit>) -> Vec<FusedUnit> {
        let mut fused: Vec<FusedUnit> = Vec::with_capacity(vector_results.len() + graph_results.len());
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for (rank, unit) in vector_results.into_iter().enumerate() {
            if by_id.contains_key(&unit.id) {
                continue;
            }
            by_id.insert(unit.id.clone(), fused.len());
            fused.push(FusedUnit {
                score: self.rrf_score(rank, self.config.vector_weight),
                unit,
                vector_rank: Some(rank),
                graph_rank: None,
                source: RetrievalSource::Vector,
            });
        }

        for (rank, unit) in graph_results.into_iter().enumerate() {
            let rrf_score = self.rrf_score(rank, self.config.graph_weight);
            match by_id.get(&unit.id) {
                Some(&idx) => {
                    let existing = &mut fused[idx];
                    if existing.graph_rank.is_none() {
                        existing.score += rrf_score;
                        existing.graph_rank = Some(rank);
                        existing.source = RetrievalSource::Both;
                    }
                }
                None => {
                    by_id.insert(unit.id.clone(), fused.len());
                    fused.push(FusedUnit {
                        unit,
                        score: rrf_score,
                        vector_rank: None,
                        graph_rank: Some(rank),
                        source: RetrievalSource::Graph,
                    });
                }
            }
        }

        fused.retain(|c| c.score >= self.config.min_score);
        fused.sort_by(|a, b| b.score.total_cmp(&a.score));
        fused.truncate(self.config.max_results);

        tracing::debug!(count = fused.len(), "RRF fusion of vector and graph units");
        fused
    }

    #[allow(clippy::cast_precision_loss)]
    fn rrf_score(&self, rank: usize, weight: f32) -> f32 {
        weight / (self.config.rrf_k + rank as f32 + 1.0)
    }
}

/// Ids of the units cited by `entities`, ordered by the rank of the first
/// entity citing them.
pub fn cited_unit_ids<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Vec<String> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .flat_map(|e| e.source_unit_ids.iter())
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str) -> TextUnit {
        TextUnit::with_id(id, "kb", format!("content of {id}"))
    }

    #[test]
    fn test_rrf_fusion_empty() {
        let retriever = HybridRetriever::default();
        assert!(retriever.fuse(vec![], vec![]).is_empty());
    }

    #[test]
    fn test_rrf_fusion_vector_only() {
        let retriever = HybridRetriever::default();
        let results = retriever.fuse(vec![unit("a")], vec![]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, RetrievalSource::Vector);
    }

    #[test]
    fn test_rrf_fusion_both_sources_rank_first() {
        let retriever = HybridRetriever::default();
        let results = retriever.fuse(vec![unit("a"), unit("b")], vec![unit("b"), unit("c")]);
        assert_eq!(results[0].unit.id, "b");
        assert_eq!(results[0].source, RetrievalSource::Both);
        assert_eq!(results[0].vector_rank, Some(1));
        assert_eq!(results[0].graph_rank, Some(0));
        let ids: Vec<_> = results.iter().map(|r| r.unit.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_equal_scores_keep_first_seen_order() {
        let retriever = HybridRetriever::new(HybridRetrieverConfig {
            vector_weight: 0.5,
            graph_weight: 0.5,
            ..HybridRetrieverConfig::default()
        });
        let results = retriever.fuse(vec![unit("v")], vec![unit("g")]);
        let ids: Vec<_> = results.iter().map(|r| r.unit.id.as_str()).collect();
        assert_eq!(ids, vec!["v", "g"]);
    }

    #[test]
    fn test_cited_unit_ids_dedup_in_rank_order() {
        let mut e1 = Entity {
            id: "e1".into(),
            name: "Alpha".into(),
            entity_type: "thing".into(),
            attributes: Default::default(),
            attribute_embedding: None,
            source_unit_ids: Default::default(),
            community_ids: Default::default(),
        };
        let mut e2 = e1.clone();
        e2.id = "e2".into();
        e1.source_unit_ids.insert("u2".into());
        e2.source_unit_ids.extend(["u1".to_string(), "u2".to_string(), "missing".to_string()]);

        assert_eq!(cited_unit_ids(&[e1, e2]), vec!["u2", "u1", "missing"]);
    }
}
