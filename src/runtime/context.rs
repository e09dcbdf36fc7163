//! Request-scoped chain state.
//!
//! A [`ChainContext`] is created per request by [`ContextBuilder`] and handed
//! by `&mut` through the compiled chain. It is never shared between requests.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::history::HistoryManager;
use crate::llm::Message;

/// Rendered to the generation step when retrieval found nothing.
pub const NO_CONTEXT: &str = "No relevant context found.";

/// Which conversation memory a request may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryFlags {
    /// Recent turns, trimmed to the history budget.
    pub short_term: bool,
    /// The full conversation, untrimmed.
    pub long_term: bool,
}

/// A piece of retrieved knowledge in rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedBlock {
    pub id: String,
    pub content: String,
    pub score: f32,
    /// Which unit produced it (e.g. "retrieve").
    pub origin: String,
}

/// Mutable state threaded through one chain execution.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub query: String,
    pub memory: MemoryFlags,
    /// Conversation memory as admitted by the memory flags.
    pub history: Vec<Message>,
    /// The caller's full history, before memory filtering.
    pub raw_history: Vec<Message>,
    pub retrieved: Vec<RetrievedBlock>,
    /// Rendered sub-graph text, if a graph unit ran.
    pub graph_context: Option<String>,
    /// Free-form values units can read and write.
    pub variables: BTreeMap<String, Value>,
    /// Messages prepared for the chat model.
    pub prompt: Vec<Message>,
    /// Output of the most recently finished unit.
    pub previous_output: Option<String>,
    pub answer: String,
    /// Kinds of the units that ran, in order.
    pub trace: Vec<String>,
}

impl ChainContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            query: query.into(),
            memory: MemoryFlags::default(),
            history: Vec::new(),
            raw_history: Vec::new(),
            retrieved: Vec::new(),
            graph_context: None,
            variables: BTreeMap::new(),
            prompt: Vec::new(),
            previous_output: None,
            answer: String::new(),
            trace: Vec::new(),
        }
    }

    /// Retrieved blocks as numbered, scored sources, or [`NO_CONTEXT`].
    pub fn knowledge_text(&self) -> String {
        let mut out = String::new();
        for (i, block) in self.retrieved.iter().enumerate() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            let _ = write!(
                out,
                "[{}] (id: {}, score: {:.3})\n{}",
                i + 1,
                block.id,
                block.score,
                block.content
            );
        }
        if let Some(graph) = self.graph_context.as_deref().filter(|g| !g.is_empty()) {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(graph);
        }
        if out.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            out
        }
    }

    /// The history as plain `role: content` lines.
    pub fn history_text(&self) -> String {
        self.history
            .iter()
            .map(|m| {
                let role = serde_json::to_value(m.role)
                    .ok()
                    .and_then(|v| v.as_str().map(ToString::to_string))
                    .unwrap_or_default();
                format!("{role}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render a variable as prompt text: strings verbatim, other values as JSON.
    pub fn variable_text(&self, name: &str) -> Option<String> {
        self.variables.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Everything a caller supplies to start a request.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub query: String,
    pub history: Vec<Message>,
    pub memory: MemoryFlags,
    pub variables: BTreeMap<String, Value>,
}

/// Assembles request-scoped [`ChainContext`]s.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    history: HistoryManager,
}

impl ContextBuilder {
    pub fn new(history: HistoryManager) -> Self {
        Self { history }
    }

    pub fn build(&self, request: ContextRequest) -> ChainContext {
        let ContextRequest {
            query,
            history,
            memory,
            variables,
        } = request;

        let mut ctx = ChainContext::new(query);
        ctx.memory = memory;
        ctx.variables = variables;
        ctx.raw_history.clone_from(&history);
        ctx.history = self.admit_history(memory, history);

        debug!(
            request_id = %ctx.request_id,
            history = ctx.history.len(),
            short_term = memory.short_term,
            long_term = memory.long_term,
            "Chain context built"
        );
        ctx
    }

    /// Apply the memory flags to the caller's history.
    pub fn admit_history(&self, memory: MemoryFlags, history: Vec<Message>) -> Vec<Message> {
        if memory.long_term {
            history
        } else if memory.short_term {
            self.history.apply(history).0
        } else {
            Vec::new()
        }
    }
}
