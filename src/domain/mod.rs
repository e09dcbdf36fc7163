//! Plain data types exchanged between the pipeline stages.
//!
//! - [`knowledge`]: text units and source documents
//! - [`graph`]: entities, relationships and community reports
//! - [`function`]: analyzed SPL function definitions

pub mod function;
pub mod graph;
pub mod knowledge;
