//! Function analyzer: spec text to ordered [`FunctionDefinition`]s.
//!
//! The grammar is chosen per agent type:
//!
//! - [`SplSyntax::Call`]: `name(arg, key = value);` statements (see [`super::parser`])
//! - [`SplSyntax::Structured`]: a YAML/JSON list of functions
//! - [`SplSyntax::Prompt`]: the whole agent spec is a prompt template run through a fixed flow

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::function::FunctionDefinition;
use crate::error::{SourcePosition, ValidationError, ValidationErrorKind};

use super::parser::parse_calls;
use super::registry::FunctionRegistry;

/// Spec grammar for an agent type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplSyntax {
    #[default]
    Call,
    Structured,
    Prompt,
}

/// Compiler settings: grammar per agent type and the prompt flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplConfig {
    pub agent_syntaxes: BTreeMap<String, SplSyntax>,
    pub default_syntax: SplSyntax,
    /// Function kinds a prompt-syntax spec expands to; `prompt` receives the
    /// spec as its template.
    pub prompt_flow: Vec<String>,
}

impl Default for SplConfig {
    fn default() -> Self {
        let agent_syntaxes = [
            ("json", SplSyntax::Structured),
            ("yaml", SplSyntax::Structured),
            ("structured", SplSyntax::Structured),
            ("prompt", SplSyntax::Prompt),
        ]
        .into_iter()
        .map(|(name, syntax)| (name.to_string(), syntax))
        .collect();
        Self {
            agent_syntaxes,
            default_syntax: SplSyntax::Call,
            prompt_flow: ["memory", "retrieve", "prompt", "chat"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SplConfig {
    /// Grammar used for `agent_type`'s specs.
    pub fn syntax_for(&self, agent_type: &str) -> SplSyntax {
        self.agent_syntaxes
            .get(agent_type)
            .copied()
            .unwrap_or(self.default_syntax)
    }
}

/// Parses specs and checks every referenced function kind is registered.
#[derive(Debug, Clone)]
pub struct FunctionAnalyzer {
    config: SplConfig,
    registry: Arc<FunctionRegistry>,
}

impl FunctionAnalyzer {
    pub fn new(config: SplConfig, registry: Arc<FunctionRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn syntax_for(&self, agent_type: &str) -> SplSyntax {
        self.config.syntax_for(agent_type)
    }

    /// Parse `spec` with the grammar of `agent_type`.
    ///
    /// Definitions come back in spec order with `position_in_chain` set.
    ///
    /// # Errors
    ///
    /// Syntax errors, an empty spec and unknown function kinds, each with the
    /// position of the offending fragment.
    pub fn analyze(&self, agent_type: &str, spec: &str) -> Result<Vec<FunctionDefinition>, ValidationError> {
        let syntax = self.syntax_for(agent_type);
        let mut definitions = match syntax {
            SplSyntax::Call => parse_calls(spec)?,
            SplSyntax::Structured => parse_structured(spec)?,
            SplSyntax::Prompt => self.prompt_flow(spec),
        };

        if definitions.is_empty() || (syntax == SplSyntax::Prompt && spec.trim().is_empty()) {
            return Err(ValidationError::new(
                ValidationErrorKind::EmptySpec,
                SourcePosition::default(),
                spec.trim(),
            ));
        }

        for (index, def) in definitions.iter_mut().enumerate() {
            def.position_in_chain = index;
            if !self.registry.contains(&def.kind) {
                return Err(ValidationError::new(
                    ValidationErrorKind::UnknownFunction {
                        name: def.kind.clone(),
                    },
                    def.position,
                    def.fragment.clone(),
                ));
            }
        }

        debug!(
            agent_type,
            ?syntax,
            functions = definitions.len(),
            "Spec analyzed"
        );
        Ok(definitions)
    }

    fn prompt_flow(&self, spec: &str) -> Vec<FunctionDefinition> {
        self.config
            .prompt_flow
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                let mut def = FunctionDefinition::new(kind.clone(), index);
                def.fragment.clone_from(kind);
                if kind == "prompt" {
                    def.parameters
                        .insert("template".to_string(), Value::String(spec.to_string()));
                }
                def
            })
            .collect()
    }
}

// =============================================================================
// Structured syntax
// =============================================================================

fn structured_error(spec: &str, offset: usize, message: impl Into<String>, fragment: &str) -> ValidationError {
    ValidationError::new(
        ValidationErrorKind::Syntax(message.into()),
        SourcePosition::locate(spec, offset),
        fragment,
    )
}

/// Parse a YAML (or JSON) document listing functions.
///
/// Accepted items:
///
/// ```yaml
/// - function: retrieve          # `kind` is an alias
///   parameters: {top_k: 3}
///   arguments: [kb]
/// - prompt: {template: "..."}   # single-key form
/// - chat                        # bare name
/// ```
///
/// The document may also be a mapping with the list under `functions`.
fn parse_structured(spec: &str) -> Result<Vec<FunctionDefinition>, ValidationError> {
    let document: serde_yaml::Value = serde_yaml::from_str(spec).map_err(|e| {
        let offset = e.location().map_or(0, |l| l.index()).min(spec.len());
        structured_error(spec, offset, e.to_string(), line_at(spec, offset))
    })?;
    let document: Value = serde_json::to_value(&document)
        .map_err(|e| structured_error(spec, 0, format!("unsupported document: {e}"), ""))?;

    let items = match document {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("functions") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => return Ok(Vec::new()),
            _ => {
                return Err(structured_error(spec, 0, "expected a list of functions", ""));
            }
        },
        _ => return Err(structured_error(spec, 0, "expected a list of functions", "")),
    };

    let mut cursor = 0;
    let mut definitions = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let (kind, parameters, arguments) = structured_item(item)
            .map_err(|message| structured_error(spec, cursor, format!("item {}: {message}", index + 1), ""))?;

        let offset = spec[cursor..].find(&kind).map_or(cursor, |found| cursor + found);
        cursor = (offset + kind.len()).min(spec.len());

        let mut def = FunctionDefinition::new(kind, index);
        def.position = SourcePosition::locate(spec, offset);
        def.fragment = line_at(spec, offset).to_string();
        def.parameters = parameters.into_iter().collect();
        def.arguments = arguments;
        definitions.push(def);
    }
    Ok(definitions)
}

type Item = (String, Map<String, Value>, Vec<Value>);

fn structured_item(item: Value) -> Result<Item, String> {
    match item {
        Value::String(kind) => Ok((kind, Map::new(), Vec::new())),
        Value::Object(mut map) => {
            let named = map.remove("function").or_else(|| map.remove("kind"));
            if let Some(name) = named {
                let Value::String(kind) = name else {
                    return Err("function name must be a string".to_string());
                };
                let parameters = match map.remove("parameters").or_else(|| map.remove("params")) {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(p)) => p,
                    Some(_) => return Err("`parameters` must be a mapping".to_string()),
                };
                let arguments = match map.remove("arguments").or_else(|| map.remove("args")) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(a)) => a,
                    Some(_) => return Err("`arguments` must be a list".to_string()),
                };
                if let Some(extra) = map.keys().next() {
                    return Err(format!("unknown field `{extra}`"));
                }
                return Ok((kind, parameters, arguments));
            }

            if map.len() != 1 {
                return Err("expected `function:` or a single-key mapping".to_string());
            }
            let Some((kind, body)) = map.into_iter().next() else {
                return Err("empty mapping".to_string());
            };
            Ok(match body {
                Value::Null => (kind, Map::new(), Vec::new()),
                Value::Object(p) => (kind, p, Vec::new()),
                Value::Array(a) => (kind, Map::new(), a),
                scalar => (kind, Map::new(), vec![scalar]),
            })
        }
        other => Err(format!("expected a function, found {}", super::registry::describe(&other))),
    }
}

fn line_at(source: &str, offset: usize) -> &str {
    let mut offset = offset.min(source.len());
    while !source.is_char_boundary(offset) {
        offset -= 1;
    }
    let start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    let end = source[offset..].find('\n').map_or(source.len(), |i| offset + i);
    source[start..end].trim()
}
