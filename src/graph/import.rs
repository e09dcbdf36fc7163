//! Graph import from flat key/value records.
//!
//! Each raw record passes through a fixed field-rename map: every target field
//! lists the source keys it accepts (first non-null wins) and what to do when
//! none is present. Keys no rule consumes are carried into `attributes`.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::domain::graph::{Attributes, CommunityReport, Entity, Relationship};
use crate::error::ImportError;
use crate::rag::embedding::{EmbeddingAdapter, decode_vector};

use super::store::KnowledgeGraph;

type Record = Map<String, Value>;

/// The three flat arrays a graph document consists of.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGraph {
    #[serde(default)]
    pub entities: Vec<Record>,
    #[serde(default)]
    pub relationships: Vec<Record>,
    #[serde(default)]
    pub communities: Vec<Record>,
}

// =============================================================================
// Field maps
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Fallback {
    Required,
    Text(&'static str),
    Number(f64),
    Empty,
}

#[derive(Debug, Clone, Copy)]
struct FieldRule {
    target: &'static str,
    sources: &'static [&'static str],
    fallback: Fallback,
}

const fn rule(target: &'static str, sources: &'static [&'static str], fallback: Fallback) -> FieldRule {
    FieldRule {
        target,
        sources,
        fallback,
    }
}

const ENTITY_FIELDS: &[FieldRule] = &[
    rule("id", &["uuid", "id"], Fallback::Required),
    rule("name", &["name", "title"], Fallback::Text("")),
    rule("type", &["type", "entity_type"], Fallback::Text("unknown")),
    rule(
        "attribute_embedding",
        &["attribute_embedding", "description_embedding"],
        Fallback::Empty,
    ),
    rule("source_unit_ids", &["text_unit_ids", "source_unit_ids"], Fallback::Empty),
    rule("community_ids", &["community_ids", "communities"], Fallback::Empty),
];

const RELATIONSHIP_FIELDS: &[FieldRule] = &[
    rule("id", &["uuid", "id"], Fallback::Required),
    rule("source", &["source_entity_uuid", "source_entity_id", "source"], Fallback::Required),
    rule("target", &["target_entity_uuid", "target_entity_id", "target"], Fallback::Required),
    rule("type", &["type", "relation_type"], Fallback::Text("related_to")),
    rule("name", &["name", "label"], Fallback::Text("")),
    rule("weight", &["weight"], Fallback::Number(1.0)),
    rule(
        "provenance_source",
        &["provenance_source", "source_id", "document_id"],
        Fallback::Text("unknown"),
    ),
];

const COMMUNITY_FIELDS: &[FieldRule] = &[
    rule("id", &["uuid", "id", "community"], Fallback::Required),
    rule("title", &["title", "name"], Fallback::Text("")),
    rule("level", &["level"], Fallback::Number(0.0)),
    rule("full_content", &["full_content", "content", "summary"], Fallback::Text("")),
    rule("rating", &["rating", "rank"], Fallback::Number(0.0)),
];

/// A record after renaming: mapped fields plus leftover attributes.
struct Mapped {
    kind: &'static str,
    index: usize,
    fields: Map<String, Value>,
    attributes: Attributes,
}

fn apply_rules(
    kind: &'static str,
    index: usize,
    mut record: Record,
    rules: &[FieldRule],
) -> Result<Mapped, ImportError> {
    let mut fields = Map::new();
    for rule in rules {
        let mut found = None;
        for key in rule.sources {
            if let Some(value) = record.remove(*key) {
                if found.is_none() && !value.is_null() {
                    found = Some(value);
                }
            }
        }
        let value = match (found, rule.fallback) {
            (Some(v), _) => v,
            (None, Fallback::Required) => {
                return Err(ImportError::MissingField {
                    kind,
                    index,
                    field: rule.target,
                });
            }
            (None, Fallback::Text(s)) => Value::String(s.to_string()),
            (None, Fallback::Number(n)) => serde_json::json!(n),
            (None, Fallback::Empty) => Value::Null,
        };
        fields.insert(rule.target.to_string(), value);
    }
    Ok(Mapped {
        kind,
        index,
        fields,
        attributes: record.into_iter().collect(),
    })
}

impl Mapped {
    fn invalid(&self, field: &'static str, expected: &'static str) -> ImportError {
        ImportError::InvalidField {
            kind: self.kind,
            index: self.index,
            field,
            expected,
        }
    }

    fn text(&self, field: &'static str) -> Result<String, ImportError> {
        match self.fields.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(self.invalid(field, "a string")),
        }
    }

    fn number(&self, field: &'static str) -> Result<f64, ImportError> {
        match self.fields.get(field) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| self.invalid(field, "a number")),
            Some(Value::String(s)) => s.trim().parse().ok().ok_or_else(|| self.invalid(field, "a number")),
            _ => Err(self.invalid(field, "a number")),
        }
    }

    fn id_set(&self, field: &'static str) -> Result<BTreeSet<String>, ImportError> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(BTreeSet::new()),
            Some(Value::String(s)) => Ok(std::iter::once(s.clone()).filter(|s| !s.is_empty()).collect()),
            Some(Value::Number(n)) => Ok(std::iter::once(n.to_string()).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(self.invalid(field, "a list of ids")),
                })
                .collect(),
            Some(_) => Err(self.invalid(field, "a list of ids")),
        }
    }

    /// Vectors arrive either as JSON arrays or as JSON-encoded strings.
    fn vector(&self, field: &'static str) -> Result<Option<Vec<f32>>, ImportError> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => decode_vector(s)
                .ok()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "an array of numbers")),
            Some(v @ Value::Array(_)) => serde_json::from_value(v.clone())
                .ok()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "an array of numbers")),
            Some(_) => Err(self.invalid(field, "an array of numbers")),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_f32(value: f64) -> f32 {
    value as f32
}

fn entity_from(index: usize, record: Record) -> Result<Entity, ImportError> {
    let m = apply_rules("entity", index, record, ENTITY_FIELDS)?;
    let id = m.text("id")?;
    let name = m.text("name")?;
    Ok(Entity {
        name: if name.is_empty() { id.clone() } else { name },
        entity_type: m.text("type")?,
        attribute_embedding: m.vector("attribute_embedding")?,
        source_unit_ids: m.id_set("source_unit_ids")?,
        community_ids: m.id_set("community_ids")?,
        id,
        attributes: m.attributes,
    })
}

fn relationship_from(index: usize, record: Record) -> Result<Relationship, ImportError> {
    let m = apply_rules("relationship", index, record, RELATIONSHIP_FIELDS)?;
    let relation_type = m.text("type")?;
    let name = m.text("name")?;
    Ok(Relationship {
        id: m.text("id")?,
        source_entity_id: m.text("source")?,
        target_entity_id: m.text("target")?,
        name: if name.is_empty() { relation_type.clone() } else { name },
        relation_type,
        weight: to_f32(m.number("weight")?),
        provenance_source: m.text("provenance_source")?,
        attributes: m.attributes,
    })
}

fn community_from(index: usize, record: Record) -> Result<CommunityReport, ImportError> {
    let m = apply_rules("community", index, record, COMMUNITY_FIELDS)?;
    let id = m.text("id")?;
    let title = m.text("title")?;
    let level = m.number("level")?;
    if level < 0.0 || level.fract() != 0.0 || level > f64::from(u32::MAX) {
        return Err(m.invalid("level", "a non-negative integer"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let level = level as u32;
    Ok(CommunityReport {
        title: if title.is_empty() { format!("Community {id}") } else { title },
        id,
        level,
        full_content: m.text("full_content")?,
        rating: to_f32(m.number("rating")?),
        attributes: m.attributes,
    })
}

// =============================================================================
// Importer
// =============================================================================

/// Converts [`RawGraph`] documents into [`KnowledgeGraph`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphImporter;

impl GraphImporter {
    /// Map and validate every record, then build the graph.
    ///
    /// # Errors
    ///
    /// The first mapping or integrity failure aborts the whole import.
    pub fn import(raw: RawGraph) -> Result<KnowledgeGraph, ImportError> {
        let (entities, relationships, communities) = Self::materialize(raw)?;
        KnowledgeGraph::build(entities, relationships, communities)
    }

    /// Parse a JSON document with `entities`, `relationships` and `communities` arrays.
    ///
    /// # Errors
    ///
    /// See [`Self::import`]; malformed JSON is [`ImportError::Malformed`].
    pub fn import_json(json: &str) -> Result<KnowledgeGraph, ImportError> {
        let raw: RawGraph =
            serde_json::from_str(json).map_err(|e| ImportError::Malformed(e.to_string()))?;
        Self::import(raw)
    }

    /// Like [`Self::import`], first embedding entities that arrive without a vector.
    ///
    /// Integrity is checked before any embedding call is made.
    ///
    /// # Errors
    ///
    /// See [`Self::import`]; embedding failures are [`ImportError::Embedding`].
    pub async fn import_with_embeddings(
        raw: RawGraph,
        embeddings: &EmbeddingAdapter,
    ) -> Result<KnowledgeGraph, ImportError> {
        let (mut entities, relationships, communities) = Self::materialize(raw)?;
        // Validate up front so a doomed import costs no model calls.
        KnowledgeGraph::build(entities.clone(), relationships.clone(), communities.clone())?;

        let pending: Vec<usize> = entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.attribute_embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|&i| embedding_text(&entities[i])).collect();
            let vectors = embeddings.embed_texts(&texts).await?;
            for (&i, vector) in pending.iter().zip(vectors) {
                entities[i].attribute_embedding = Some(vector);
            }
            debug!(count = pending.len(), "Embedded entity attributes");
        }

        KnowledgeGraph::build(entities, relationships, communities)
    }

    fn materialize(
        raw: RawGraph,
    ) -> Result<(Vec<Entity>, Vec<Relationship>, Vec<CommunityReport>), ImportError> {
        let entities = raw
            .entities
            .into_iter()
            .enumerate()
            .map(|(i, r)| entity_from(i, r))
            .collect::<Result<Vec<_>, _>>()?;
        let relationships = raw
            .relationships
            .into_iter()
            .enumerate()
            .map(|(i, r)| relationship_from(i, r))
            .collect::<Result<Vec<_>, _>>()?;
        let communities = raw
            .communities
            .into_iter()
            .enumerate()
            .map(|(i, r)| community_from(i, r))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            entities = entities.len(),
            relationships = relationships.len(),
            communities = communities.len(),
            "Graph records mapped"
        );
        Ok((entities, relationships, communities))
    }
}

fn embedding_text(entity: &Entity) -> String {
    match entity.description() {
        Some(desc) if !desc.is_empty() => format!("{}: {desc}", entity.name),
        _ => entity.name.clone(),
    }
}
