//! Error taxonomy shared by the ingestion, graph, compiler and execution layers.
//!
//! Retrieval degradation (empty candidate sets, zero vectors, empty graphs) is
//! deliberately absent: those cases produce empty results, not errors.

use std::fmt;

use thiserror::Error;

// =============================================================================
// Validation
// =============================================================================

/// Location of a fragment inside an SPL spec (1-based line/column, 0-based byte offset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl SourcePosition {
    /// Compute the position of `offset` within `source`.
    pub fn locate(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let mut line = 1;
        let mut column = 1;
        for (idx, ch) in source.char_indices() {
            if idx >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Self {
            line,
            column,
            offset,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// What went wrong while compiling a spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The spec text does not follow the agent type's grammar.
    Syntax(String),
    /// The spec contained no function calls.
    EmptySpec,
    /// A call references a function kind that is not registered.
    UnknownFunction { name: String },
    /// A required parameter was not supplied.
    MissingParameter { function: String, parameter: String },
    /// A parameter is not declared by the function kind.
    UnexpectedParameter { function: String, parameter: String },
    /// A parameter was given both positionally and by name, or twice by name.
    DuplicateParameter { function: String, parameter: String },
    /// A parameter has the wrong type.
    InvalidParameter {
        function: String,
        parameter: String,
        expected: String,
        found: String,
    },
    /// The function kind exists but cannot be bound (e.g. no chat model configured).
    Binding { function: String, reason: String },
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "syntax error: {msg}"),
            Self::EmptySpec => write!(f, "spec defines no functions"),
            Self::UnknownFunction { name } => write!(f, "unknown function `{name}`"),
            Self::MissingParameter {
                function,
                parameter,
            } => write!(f, "function `{function}` requires parameter `{parameter}`"),
            Self::UnexpectedParameter {
                function,
                parameter,
            } => write!(f, "function `{function}` has no parameter `{parameter}`"),
            Self::DuplicateParameter {
                function,
                parameter,
            } => write!(f, "parameter `{parameter}` of `{function}` is given more than once"),
            Self::InvalidParameter {
                function,
                parameter,
                expected,
                found,
            } => write!(
                f,
                "parameter `{parameter}` of `{function}` expects {expected}, found {found}"
            ),
            Self::Binding { function, reason } => {
                write!(f, "function `{function}` cannot be bound: {reason}")
            }
        }
    }
}

/// A compile-time error, reported with the offending fragment and its position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at {position}: `{fragment}`")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub position: SourcePosition,
    pub fragment: String,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, position: SourcePosition, fragment: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            fragment: fragment.into(),
        }
    }
}

// =============================================================================
// Referential integrity
// =============================================================================

/// Which end of a relationship failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// A relationship references an entity absent from the imported entity set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("relationship `{relationship_id}` {endpoint} references unknown entity `{entity_id}`")]
pub struct ReferentialIntegrityError {
    pub relationship_id: String,
    pub endpoint: Endpoint,
    pub entity_id: String,
}

/// Why a graph import was rejected. No partial graph is ever produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ImportError {
    #[error("malformed graph document: {0}")]
    Malformed(String),
    #[error("{kind} #{index}: missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        index: usize,
        field: &'static str,
    },
    #[error("{kind} #{index}: field `{field}` expects {expected}")]
    InvalidField {
        kind: &'static str,
        index: usize,
        field: &'static str,
        expected: &'static str,
    },
    #[error("duplicate {kind} id `{id}`")]
    DuplicateId { kind: &'static str, id: String },
    #[error(transparent)]
    ReferentialIntegrity(#[from] ReferentialIntegrityError),
    #[error("embedding entities failed: {0}")]
    Embedding(#[from] ExternalCallError),
}

// =============================================================================
// External calls
// =============================================================================

/// Failure talking to an embedding model, chat model or knowledge store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{collaborator} call failed: {message}")]
pub struct ExternalCallError {
    /// Name of the collaborator (e.g. "embedder", "chat", "knowledge").
    pub collaborator: String,
    pub message: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
}

impl ExternalCallError {
    pub fn retryable(collaborator: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            collaborator: collaborator.into(),
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn fatal(collaborator: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            collaborator: collaborator.into(),
            message: message.to_string(),
            retryable: false,
        }
    }

    /// Classify a reqwest failure: timeouts, connection errors and 5xx/429 may be retried.
    pub fn from_http(collaborator: impl Into<String>, err: &reqwest::Error) -> Self {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        Self {
            collaborator: collaborator.into(),
            message: err.to_string(),
            retryable,
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Why a chain execution stopped early. The compiled chain stays reusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("unit {index} (`{kind}`) failed: {source}")]
    Unit {
        index: usize,
        kind: String,
        #[source]
        source: ExternalCallError,
    },
    #[error("execution cancelled before unit {next_index}")]
    Cancelled { next_index: usize },
}
