//! Function kinds known to the compiler.
//!
//! Each kind declares its parameters (in positional order) and a factory that
//! turns validated parameters into a [`FunctionalUnit`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::builder::UnitResources;
use super::unit::{BoundParams, FunctionalUnit};

/// Accepted shape of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    /// Integer that is zero or more: counts, sizes, levels.
    NonNegativeInteger,
    Number,
    Bool,
    List,
    Any,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::NonNegativeInteger => value.is_u64(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::NonNegativeInteger => "a non-negative integer",
            Self::Number => "a number",
            Self::Bool => "a boolean",
            Self::List => "a list",
            Self::Any => "any value",
        })
    }
}

/// Human-readable shape of a value, for error messages.
pub fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a number",
        Value::Number(n) if n.is_i64() && !n.is_u64() => "a negative integer",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Builds a fresh unit from validated parameters.
pub type UnitFactory =
    Arc<dyn Fn(&BoundParams, &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> + Send + Sync>;

/// A registered function kind.
#[derive(Clone)]
pub struct FunctionSpec {
    pub kind: String,
    pub params: Vec<ParamSpec>,
    factory: UnitFactory,
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("kind", &self.kind)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl FunctionSpec {
    pub fn new<F>(kind: impl Into<String>, params: Vec<ParamSpec>, factory: F) -> Self
    where
        F: Fn(&BoundParams, &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            params,
            factory: Arc::new(factory),
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Invoke the factory. Each call yields an independent unit.
    pub fn instantiate(&self, params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        (self.factory)(params, resources)
    }
}

/// Function kinds by name.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, FunctionSpec>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in kinds (`memory`, `retrieve`,
    /// `graph_retrieve`, `prompt`, `chat`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::units::register_builtins(&mut registry);
        registry
    }

    /// Add or replace a kind.
    pub fn register(&mut self, spec: FunctionSpec) -> &mut Self {
        tracing::debug!(kind = %spec.kind, "Function registered");
        self.functions.insert(spec.kind.clone(), spec);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&FunctionSpec> {
        self.functions.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.functions.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_types() {
        assert!(ParamType::Integer.accepts(&json!(3)));
        assert!(!ParamType::Integer.accepts(&json!(3.5)));
        assert!(ParamType::Integer.accepts(&json!(-3)));
        assert!(ParamType::NonNegativeInteger.accepts(&json!(0)));
        assert!(!ParamType::NonNegativeInteger.accepts(&json!(-3)));
        assert!(!ParamType::NonNegativeInteger.accepts(&json!(2.0)));
        assert_eq!(describe(&json!(-1)), "a negative integer");
        assert!(ParamType::Number.accepts(&json!(3)));
        assert!(ParamType::List.accepts(&json!([1])));
        assert!(!ParamType::String.accepts(&json!(1)));
        assert_eq!(describe(&json!(2.5)), "a number");
        assert_eq!(describe(&json!({"a": 1})), "a mapping");
    }

    #[test]
    fn test_builtins_registered() {
        let registry = FunctionRegistry::with_builtins();
        let kinds: Vec<_> = registry.kinds().collect();
        assert_eq!(kinds, vec!["chat", "graph_retrieve", "memory", "prompt", "retrieve"]);
        assert!(registry.get("prompt").unwrap().param("template").is_some());
    }
}
