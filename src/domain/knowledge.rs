use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw extracted text of one uploaded document, destined for one collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDocument {
    /// Collection the resulting units belong to.
    pub collection_id: String,
    /// Optional human-readable name (file name, title).
    #[serde(default)]
    pub name: Option<String>,
    /// UTF-8 text produced by the document-reader collaborator.
    pub text: String,
}

impl SourceDocument {
    pub fn new(collection_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            name: None,
            text: text.into(),
        }
    }
}

/// Result of [`TextUnit::attach_embedding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The vector was stored.
    Attached,
    /// A vector was already present; the new one was ignored.
    AlreadyAttached,
}

/// A retrievable unit of text produced by the chunker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextUnit {
    pub id: String,
    pub content: String,
    /// Every unit belongs to exactly one collection.
    pub source_collection_id: String,
    /// Attached once, after chunking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
    /// Query-scoped score, never persisted.
    #[serde(skip)]
    pub similarity_score: Option<f32>,
}

impl TextUnit {
    /// Create a unit with a fresh id.
    pub fn new(collection_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), collection_id, content)
    }

    pub fn with_id(
        id: impl Into<String>,
        collection_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source_collection_id: collection_id.into(),
            embedding: None,
            similarity_score: None,
        }
    }

    /// Builder-style attach, for units loaded back from storage.
    #[must_use]
    pub fn with_embedding(mut self, vector: Vec<f32>) -> Self {
        self.attach_embedding(vector);
        self
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// Attach a vector exactly once. Retries after a successful attach are no-ops.
    pub fn attach_embedding(&mut self, vector: Vec<f32>) -> AttachOutcome {
        if self.embedding.is_some() {
            return AttachOutcome::AlreadyAttached;
        }
        self.embedding = Some(vector);
        AttachOutcome::Attached
    }
}
