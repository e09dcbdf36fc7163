//! Retrieval-augmented generation and agent-chain compilation core.
//!
//! Turns raw documents into searchable units, ranks them against queries by
//! embedding similarity or knowledge-graph structure, and compiles
//! declarative agent specs (SPL) into chains of executable units that stream
//! an answer.
//!
//! # Architecture
//!
//! - **Ingestion**: chunk → wrap into text units → attach embeddings
//! - **Retrieval**: cosine ranking, graph sub-graph selection, rank fusion
//! - **Compiler**: analyze spec → build units → compiled chain (cached per agent version)
//! - **Execution**: run the chain against a request-scoped context as a token stream
//!
//! # Modules
//!
//! - [`rag`]: chunking, embedding attachment, ranking, ingestion
//! - [`graph`]: knowledge graph import, retrieval and context rendering
//! - [`spl`]: SPL analyzer, unit builder, flow builder and executor
//! - [`runtime`]: chain context, history trimming, token counting, retries
//! - [`llm`]: chat and embedding model collaborators
//! - [`config`]: layered configuration and CLI

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod domain;
pub mod error;
pub mod graph;
pub mod llm;
pub mod rag;
pub mod runtime;
pub mod spl;
pub mod telemetry;

pub use error::{
    ExecutionError, ExternalCallError, ImportError, ReferentialIntegrityError, SourcePosition, ValidationError,
    ValidationErrorKind,
};
