//! GraphRAG Domain Models
//!
//! Entity, relationship and community report records as they exist after
//! import. Relationships and entities refer to each other by id only; all
//! traversal goes through the owning [`crate::graph::KnowledgeGraph`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Free-form attributes carried through from the import map.
pub type Attributes = BTreeMap<String, Value>;

// =============================================================================
// Entity
// =============================================================================

/// A node of the knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Entity type classification (person, organization, ...)
    pub entity_type: String,
    /// Remaining key/value pairs from the source record
    #[serde(default)]
    pub attributes: Attributes,
    /// Vector embedding of the entity's description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_embedding: Option<Vec<f32>>,
    /// Text units this entity was extracted from
    #[serde(default)]
    pub source_unit_ids: BTreeSet<String>,
    /// Communities this entity belongs to
    #[serde(default)]
    pub community_ids: BTreeSet<String>,
}

impl Entity {
    /// The `description` attribute, when it is a string.
    pub fn description(&self) -> Option<&str> {
        self.attributes.get("description").and_then(Value::as_str)
    }
}

// =============================================================================
// Relationship
// =============================================================================

/// A directed edge. Several relationships may connect the same pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    /// Unique identifier
    pub id: String,
    /// Source entity ID
    pub source_entity_id: String,
    /// Target entity ID
    pub target_entity_id: String,
    /// Relationship type (e.g., "works_at", "mentions")
    pub relation_type: String,
    /// Human-readable label
    pub name: String,
    /// Edge weight (defaults to 1.0)
    pub weight: f32,
    #[serde(default)]
    pub attributes: Attributes,
    /// Where the relationship was observed
    pub provenance_source: String,
}

impl Relationship {
    pub fn description(&self) -> Option<&str> {
        self.attributes.get("description").and_then(Value::as_str)
    }
}

// =============================================================================
// Community Report
// =============================================================================

/// A pre-computed summary of a cluster of entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommunityReport {
    /// Unique identifier
    pub id: String,
    pub title: String,
    /// Hierarchy level (0 = leaf clusters)
    pub level: u32,
    pub full_content: String,
    /// Importance rating assigned at summarization time
    pub rating: f32,
    #[serde(default)]
    pub attributes: Attributes,
}
