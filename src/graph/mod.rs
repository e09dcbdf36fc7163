//! Knowledge graph import, retrieval and context rendering.
//!
//! ```text
//! RawGraph ──GraphImporter──▶ KnowledgeGraph ──GraphRetriever──▶ SubGraph ──GraphContextBuilder──▶ text
//! ```

pub mod context;
pub mod import;
pub mod retrieve;
pub mod store;

pub use context::{GraphContext, GraphContextBuilder};
pub use import::{GraphImporter, RawGraph};
pub use retrieve::{GraphRetrievalConfig, GraphRetriever, SubGraph};
pub use store::KnowledgeGraph;
