//! Immutable in-memory knowledge graph.
//!
//! Entities, relationships and community reports live in three arenas indexed
//! by id. A `petgraph` adjacency over entity indices is built once so
//! neighbourhood lookups do not scan the relationship list. There are no
//! mutating methods: re-import to change a graph.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{info, warn};

use crate::domain::graph::{CommunityReport, Entity, Relationship};
use crate::error::{Endpoint, ImportError, ReferentialIntegrityError};

#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    communities: Vec<CommunityReport>,
    entity_index: HashMap<String, usize>,
    relationship_index: HashMap<String, usize>,
    community_index: HashMap<String, usize>,
    /// Node `i` is entity `i`; edge weights are relationship indices.
    adjacency: DiGraph<usize, usize>,
}

impl KnowledgeGraph {
    /// Build a graph, running integrity checks first.
    ///
    /// # Errors
    ///
    /// Rejects duplicate ids within a kind and relationships whose endpoints
    /// are not in `entities`.
    pub fn build(
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
        communities: Vec<CommunityReport>,
    ) -> Result<Self, ImportError> {
        let entity_index = index_by_id("entity", entities.iter().map(|e| e.id.as_str()))?;
        let relationship_index =
            index_by_id("relationship", relationships.iter().map(|r| r.id.as_str()))?;
        let community_index =
            index_by_id("community", communities.iter().map(|c| c.id.as_str()))?;

        let mut adjacency = DiGraph::with_capacity(entities.len(), relationships.len());
        for idx in 0..entities.len() {
            adjacency.add_node(idx);
        }

        for (rel_idx, rel) in relationships.iter().enumerate() {
            let source = resolve(&entity_index, rel, Endpoint::Source)?;
            let target = resolve(&entity_index, rel, Endpoint::Target)?;
            adjacency.add_edge(NodeIndex::new(source), NodeIndex::new(target), rel_idx);
        }

        for entity in &entities {
            for community_id in &entity.community_ids {
                if !community_index.contains_key(community_id) {
                    warn!(entity = %entity.id, community = %community_id, "Entity references unknown community");
                }
            }
        }

        info!(
            entities = entities.len(),
            relationships = relationships.len(),
            communities = communities.len(),
            "Knowledge graph built"
        );

        Ok(Self {
            entities,
            relationships,
            communities,
            entity_index,
            relationship_index,
            community_index,
            adjacency,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn communities(&self) -> &[CommunityReport] {
        &self.communities
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entity_index.get(id).map(|&i| &self.entities[i])
    }

    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationship_index.get(id).map(|&i| &self.relationships[i])
    }

    pub fn community(&self, id: &str) -> Option<&CommunityReport> {
        self.community_index.get(id).map(|&i| &self.communities[i])
    }

    /// Relationships touching `entity_id` in either direction, outgoing first.
    pub fn edges_of(&self, entity_id: &str) -> Vec<&Relationship> {
        let Some(&idx) = self.entity_index.get(entity_id) else {
            return Vec::new();
        };
        let node = NodeIndex::new(idx);
        let mut rel_indices: Vec<usize> = self
            .adjacency
            .edges_directed(node, Direction::Outgoing)
            .chain(self.adjacency.edges_directed(node, Direction::Incoming))
            .map(|e| *e.weight())
            .collect();
        // petgraph yields edges newest-first; restore import order.
        rel_indices.sort_unstable();
        rel_indices.dedup();
        rel_indices.into_iter().map(|i| &self.relationships[i]).collect()
    }

    /// Ids of entities one hop away from `entity_id`, in either direction.
    pub fn neighbors(&self, entity_id: &str) -> Vec<&str> {
        let Some(&idx) = self.entity_index.get(entity_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut out: Vec<usize> = self
            .adjacency
            .neighbors_undirected(NodeIndex::new(idx))
            .map(NodeIndex::index)
            .filter(|n| seen.insert(*n))
            .collect();
        out.sort_unstable();
        out.into_iter().map(|i| self.entities[i].id.as_str()).collect()
    }

    /// Whether `entity` belongs to at least one known community at `level`.
    pub fn entity_at_level(&self, entity: &Entity, level: u32) -> bool {
        entity
            .community_ids
            .iter()
            .filter_map(|id| self.community(id))
            .any(|c| c.level == level)
    }
}

fn index_by_id<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, usize>, ImportError> {
    let mut index = HashMap::new();
    for (i, id) in ids.enumerate() {
        if index.insert(id.to_string(), i).is_some() {
            return Err(ImportError::DuplicateId {
                kind,
                id: id.to_string(),
            });
        }
    }
    Ok(index)
}

fn resolve(
    index: &HashMap<String, usize>,
    rel: &Relationship,
    endpoint: Endpoint,
) -> Result<usize, ReferentialIntegrityError> {
    let entity_id = match endpoint {
        Endpoint::Source => &rel.source_entity_id,
        Endpoint::Target => &rel.target_entity_id,
    };
    index
        .get(entity_id)
        .copied()
        .ok_or_else(|| ReferentialIntegrityError {
            relationship_id: rel.id.clone(),
            endpoint,
            entity_id: entity_id.clone(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    pub(crate) fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            entity_type: "thing".to_string(),
            attributes: Default::default(),
            attribute_embedding: None,
            source_unit_ids: BTreeSet::new(),
            community_ids: BTreeSet::new(),
        }
    }

    pub(crate) fn relationship(id: &str, source: &str, target: &str) -> Relationship {
        Relationship {
            id: id.to_string(),
            source_entity_id: source.to_string(),
            target_entity_id: target.to_string(),
            relation_type: "related_to".to_string(),
            name: format!("{source}->{target}"),
            weight: 1.0,
            attributes: Default::default(),
            provenance_source: "test".to_string(),
        }
    }

    #[test]
    fn test_build_and_lookup() {
        let graph = KnowledgeGraph::build(
            vec![entity("a", "A"), entity("b", "B"), entity("c", "C")],
            vec![
                relationship("r1", "a", "b"),
                relationship("r2", "c", "a"),
                relationship("r3", "a", "b"),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(graph.entity("b").map(|e| e.name.as_str()), Some("B"));
        assert!(graph.entity("zzz").is_none());
        assert_eq!(graph.relationship("r2").unwrap().source_entity_id, "c");

        let edges: Vec<_> = graph.edges_of("a").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(edges, vec!["r1", "r2", "r3"]);
        assert_eq!(graph.neighbors("a"), vec!["b", "c"]);
        assert!(graph.edges_of("missing").is_empty());
    }

    #[test]
    fn test_dangling_target_rejected() {
        let err = KnowledgeGraph::build(
            vec![entity("e1", "One")],
            vec![relationship("r1", "e1", "e2")],
            vec![],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ImportError::ReferentialIntegrity(ReferentialIntegrityError {
                relationship_id: "r1".to_string(),
                endpoint: Endpoint::Target,
                entity_id: "e2".to_string(),
            })
        );
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let err = KnowledgeGraph::build(vec![entity("a", "A"), entity("a", "A2")], vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, ImportError::DuplicateId { kind: "entity", .. }));
    }
}
