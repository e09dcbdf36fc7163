//! Sub-graph selection for a query.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::graph::{CommunityReport, Entity, Relationship};
use crate::rag::ranking::{Scored, cosine_similarity};

use super::store::KnowledgeGraph;

/// Bounds and filters for [`GraphRetriever`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphRetrievalConfig {
    pub max_entities: usize,
    pub max_relationships: usize,
    pub max_communities: usize,
    /// Also include edges from selected entities to unselected neighbours.
    pub expand_neighbors: bool,
    /// Only consider entities that belong to a community at this level.
    pub graph_level: Option<u32>,
    /// Entities must score strictly above this.
    pub min_score: f32,
}

impl Default for GraphRetrievalConfig {
    fn default() -> Self {
        Self {
            max_entities: 10,
            max_relationships: 20,
            max_communities: 3,
            expand_neighbors: true,
            graph_level: None,
            min_score: 0.0,
        }
    }
}

/// A relationship with its endpoint names resolved for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SubGraphEdge {
    pub relationship: Relationship,
    pub source_name: String,
    pub target_name: String,
}

/// The bounded, ranked part of a graph relevant to one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubGraph {
    pub entities: Vec<Scored<Entity>>,
    pub relationships: Vec<SubGraphEdge>,
    pub reports: Vec<CommunityReport>,
}

impl SubGraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.reports.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphRetriever {
    config: GraphRetrievalConfig,
}

impl GraphRetriever {
    pub fn new(config: GraphRetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GraphRetrievalConfig {
        &self.config
    }

    /// Select entities, relationships and reports relevant to `query`.
    ///
    /// `query_vector`, when given, is compared against entity
    /// `attribute_embedding`s; an entity scores the better of its lexical and
    /// vector similarity. An empty graph or an unmatched query yields an empty
    /// sub-graph.
    pub fn retrieve(&self, graph: &KnowledgeGraph, query: &str, query_vector: Option<&[f32]>) -> SubGraph {
        if graph.is_empty() {
            debug!("Graph is empty, nothing to retrieve");
            return SubGraph::default();
        }

        let terms = query_terms(query);
        let query_lower = query.to_lowercase();

        let mut scored: Vec<Scored<&Entity>> = graph
            .entities()
            .iter()
            .filter(|e| self.config.graph_level.is_none_or(|level| graph.entity_at_level(e, level)))
            .map(|e| {
                let lexical = lexical_score(e, &query_lower, &terms);
                let semantic = match (query_vector, e.attribute_embedding.as_deref()) {
                    (Some(q), Some(v)) => cosine_similarity(q, v),
                    _ => 0.0,
                };
                Scored {
                    item: e,
                    score: lexical.max(semantic),
                }
            })
            .filter(|s| s.score > self.config.min_score)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.config.max_entities);

        let selected: HashMap<&str, f32> = scored.iter().map(|s| (s.item.id.as_str(), s.score)).collect();
        let relationships = self.select_relationships(graph, &scored, &selected);
        let reports = self.select_reports(graph, &scored);

        debug!(
            entities = scored.len(),
            relationships = relationships.len(),
            reports = reports.len(),
            "Sub-graph retrieved"
        );

        SubGraph {
            entities: scored
                .into_iter()
                .map(|s| Scored {
                    item: s.item.clone(),
                    score: s.score,
                })
                .collect(),
            relationships,
            reports,
        }
    }

    fn select_relationships(
        &self,
        graph: &KnowledgeGraph,
        ranked: &[Scored<&Entity>],
        selected: &HashMap<&str, f32>,
    ) -> Vec<SubGraphEdge> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<(&Relationship, bool, f32)> = Vec::new();
        for s in ranked {
            for rel in graph.edges_of(&s.item.id) {
                if !seen.insert(rel.id.as_str()) {
                    continue;
                }
                let source = selected.get(rel.source_entity_id.as_str());
                let target = selected.get(rel.target_entity_id.as_str());
                let internal = source.is_some() && target.is_some();
                if !internal && !self.config.expand_neighbors {
                    continue;
                }
                let key = source.copied().unwrap_or(0.0) + target.copied().unwrap_or(0.0);
                candidates.push((rel, internal, key));
            }
        }

        // Internal edges first, then by endpoint relevance, then weight.
        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| b.0.weight.total_cmp(&a.0.weight))
        });
        candidates.truncate(self.config.max_relationships);

        let name_of = |id: &str| graph.entity(id).map_or_else(|| id.to_string(), |e| e.name.clone());
        candidates
            .into_iter()
            .map(|(rel, _, _)| SubGraphEdge {
                source_name: name_of(&rel.source_entity_id),
                target_name: name_of(&rel.target_entity_id),
                relationship: rel.clone(),
            })
            .collect()
    }

    fn select_reports(&self, graph: &KnowledgeGraph, ranked: &[Scored<&Entity>]) -> Vec<CommunityReport> {
        let mut seen = BTreeSet::new();
        let mut reports: Vec<&CommunityReport> = ranked
            .iter()
            .flat_map(|s| s.item.community_ids.iter())
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| graph.community(id))
            .filter(|c| self.config.graph_level.is_none_or(|level| c.level == level))
            .collect();
        reports.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        reports.truncate(self.config.max_communities);
        reports.into_iter().cloned().collect()
    }
}

/// Lowercased query words of two or more characters, deduplicated, in order.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// 1.0 when the query mentions the entity name verbatim; otherwise the share
/// of query terms found, with name hits counting double.
fn lexical_score(entity: &Entity, query_lower: &str, terms: &[String]) -> f32 {
    let name = entity.name.trim().to_lowercase();
    if !name.is_empty() && contains_phrase(query_lower, &name) {
        return 1.0;
    }
    if terms.is_empty() {
        return 0.0;
    }

    let name_words = words(&entity.name);
    let mut attribute_text = entity.entity_type.clone();
    for value in entity.attributes.values() {
        if let Some(s) = value.as_str() {
            attribute_text.push(' ');
            attribute_text.push_str(s);
        }
    }
    let attribute_words = words(&attribute_text);

    let mut hits = 0usize;
    for term in terms {
        if name_words.contains(term) {
            hits += 2;
        } else if attribute_words.contains(term) {
            hits += 1;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f32 / (2 * terms.len()) as f32;
    score.min(1.0)
}

/// Whole-word containment, so "art" does not match "start".
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::tests::{entity, relationship};
    use serde_json::json;

    fn community(id: &str, level: u32, rating: f32) -> CommunityReport {
        CommunityReport {
            id: id.to_string(),
            title: format!("Community {id}"),
            level,
            full_content: format!("report {id}"),
            rating,
            attributes: Default::default(),
        }
    }

    fn sample_graph() -> KnowledgeGraph {
        let mut ada = entity("ada", "Ada Lovelace");
        ada.attributes.insert("description".into(), json!("wrote the first program"));
        ada.community_ids.extend(["c0".to_string(), "c1".to_string()]);
        let mut babbage = entity("babbage", "Charles Babbage");
        babbage.attributes.insert("description".into(), json!("designed the analytical engine"));
        babbage.community_ids.insert("c1".to_string());
        let mut engine = entity("engine", "Analytical Engine");
        engine.attribute_embedding = Some(vec![1.0, 0.0]);
        let weather = entity("weather", "Weather");

        KnowledgeGraph::build(
            vec![ada, babbage, engine, weather],
            vec![
                relationship("r1", "ada", "babbage"),
                relationship("r2", "babbage", "engine"),
                relationship("r3", "weather", "engine"),
            ],
            vec![community("c0", 0, 2.0), community("c1", 1, 9.0)],
        )
        .unwrap()
    }

    #[test]
    fn test_exact_name_mention_ranks_first() {
        let graph = sample_graph();
        let sub = GraphRetriever::default().retrieve(&graph, "What did Ada Lovelace write?", None);
        assert_eq!(sub.entities[0].item.id, "ada");
        assert!((sub.entities[0].score - 1.0).abs() < f32::EPSILON);
        assert!(sub.entities.iter().all(|s| s.item.id != "weather"));
        // Highest-rated community first.
        assert_eq!(sub.reports[0].id, "c1");
    }

    #[test]
    fn test_vector_similarity_selects_entity() {
        let graph = sample_graph();
        let sub = GraphRetriever::default().retrieve(&graph, "zzz", Some(&[1.0, 0.0]));
        let ids: Vec<_> = sub.entities.iter().map(|s| s.item.id.as_str()).collect();
        assert_eq!(ids, vec!["engine"]);
        // Neighbour edges of the engine are expanded.
        assert_eq!(sub.relationships.len(), 2);
        assert_eq!(sub.relationships[0].target_name, "Analytical Engine");
    }

    #[test]
    fn test_internal_edges_only_without_expansion() {
        let graph = sample_graph();
        let retriever = GraphRetriever::new(GraphRetrievalConfig {
            expand_neighbors: false,
            ..GraphRetrievalConfig::default()
        });
        let sub = retriever.retrieve(&graph, "Ada Lovelace and Charles Babbage", None);
        let rel_ids: Vec<_> = sub.relationships.iter().map(|e| e.relationship.id.as_str()).collect();
        assert_eq!(rel_ids, vec!["r1"]);
    }

    #[test]
    fn test_graph_level_filter() {
        let graph = sample_graph();
        let retriever = GraphRetriever::new(GraphRetrievalConfig {
            graph_level: Some(0),
            ..GraphRetrievalConfig::default()
        });
        let sub = retriever.retrieve(&graph, "Ada Lovelace Charles Babbage", None);
        let ids: Vec<_> = sub.entities.iter().map(|s| s.item.id.as_str()).collect();
        assert_eq!(ids, vec!["ada"]);
        assert_eq!(sub.reports.len(), 1);
        assert_eq!(sub.reports[0].id, "c0");
    }

    #[test]
    fn test_empty_graph_and_no_match() {
        let empty = KnowledgeGraph::default();
        assert!(GraphRetriever::default().retrieve(&empty, "anything", None).is_empty());
        let sub = GraphRetriever::default().retrieve(&sample_graph(), "", None);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_lexical_partial_match() {
        let e = entity("x", "Charles Babbage");
        let terms = query_terms("babbage inventions");
        let score = lexical_score(&e, "babbage inventions", &terms);
        assert!((score - 0.5).abs() < 1e-6);
        assert!(!contains_phrase("restart", "art"));
        assert!(contains_phrase("modern art today", "art"));
    }
}
