//! Ingestion and vector retrieval.
//!
//! - [`chunking`]: splits document text into units
//! - [`embedding`]: attaches vectors to units
//! - [`ranking`]: cosine similarity ranking
//! - [`retrieval`]: rank fusion of vector and graph results
//! - [`knowledge`]: query-time search over stored units
//! - [`ingest`]: chunk + embed pipeline over document batches

pub mod chunking;
pub mod embedding;
pub mod ingest;
pub mod knowledge;
pub mod ranking;
pub mod retrieval;

pub use chunking::{Chunker, ChunkingStrategy};
pub use embedding::EmbeddingAdapter;
pub use ingest::IngestPipeline;
pub use knowledge::{InMemoryKnowledge, KnowledgeSource};
pub use ranking::{Scored, SimilarityRanker, cosine_similarity, rank_by_vector};
