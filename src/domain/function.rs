use crate::error::SourcePosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One function call extracted from an SPL spec.
///
/// Definitions are ordered: `position_in_chain` is the execution index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub kind: String,
    /// Keyword arguments.
    pub parameters: BTreeMap<String, Value>,
    /// Positional arguments, bound to declared parameter order at build time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    pub position_in_chain: usize,
    /// Where the call starts in the agent spec text.
    pub position: SourcePosition,
    /// The call as written, for error reporting.
    pub fragment: String,
}

impl FunctionDefinition {
    pub fn new(kind: impl Into<String>, position_in_chain: usize) -> Self {
        Self {
            kind: kind.into(),
            parameters: BTreeMap::new(),
            arguments: Vec::new(),
            position_in_chain,
            position: SourcePosition::default(),
            fragment: String::new(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}
