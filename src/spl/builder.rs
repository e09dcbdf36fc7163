//! Functional unit builder: binds a definition's parameters and instantiates its unit.

use std::collections::{BTreeMap, btree_map::Entry};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::domain::function::FunctionDefinition;
use crate::error::{ValidationError, ValidationErrorKind};
use crate::graph::{GraphRetrievalConfig, KnowledgeGraph};
use crate::llm::ChatModel;
use crate::rag::embedding::EmbeddingAdapter;
use crate::rag::knowledge::KnowledgeSource;
use crate::rag::retrieval::HybridRetrieverConfig;
use crate::runtime::history::{HistoryConfig, HistoryManager};
use crate::runtime::retry::RetryPolicy;
use crate::runtime::token_service::TokenService;

use super::registry::{FunctionRegistry, describe};
use super::unit::{BoundParams, FunctionalUnit};

/// Fallback values for unit parameters an agent spec leaves out.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDefaults {
    pub top_k: usize,
    pub min_score: f32,
    pub graph: GraphRetrievalConfig,
    /// Fusion weights for `retrieve(hybrid = true)`.
    pub hybrid: HybridRetrieverConfig,
    pub max_context_tokens: usize,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    /// Retry policy for opening a chat stream.
    pub chat_retry: RetryPolicy,
}

impl Default for UnitDefaults {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
            graph: GraphRetrievalConfig::default(),
            hybrid: HybridRetrieverConfig::default(),
            max_context_tokens: 2000,
            temperature: None,
            system_prompt: None,
            chat_retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators and settings units are bound to at build time.
#[derive(Debug, Clone)]
pub struct UnitResources {
    pub chat: Option<Arc<dyn ChatModel>>,
    pub knowledge: Option<Arc<dyn KnowledgeSource>>,
    /// Used to embed graph queries when entities carry vectors.
    pub embeddings: Option<EmbeddingAdapter>,
    /// Graphs by name; a single graph is the default for `graph_retrieve`.
    pub graphs: BTreeMap<String, Arc<KnowledgeGraph>>,
    pub tokens: TokenService,
    pub history: HistoryManager,
    pub defaults: UnitDefaults,
}

impl Default for UnitResources {
    fn default() -> Self {
        let tokens = TokenService::new();
        Self {
            chat: None,
            knowledge: None,
            embeddings: None,
            graphs: BTreeMap::new(),
            history: HistoryManager::new(HistoryConfig::default(), tokens.clone()),
            tokens,
            defaults: UnitDefaults::default(),
        }
    }
}

/// Turns [`FunctionDefinition`]s into [`FunctionalUnit`]s.
///
/// Building is memo-free: every call produces a new unit instance.
#[derive(Debug, Clone)]
pub struct FunctionalUnitBuilder {
    registry: Arc<FunctionRegistry>,
    resources: UnitResources,
}

impl FunctionalUnitBuilder {
    pub fn new(registry: Arc<FunctionRegistry>, resources: UnitResources) -> Self {
        Self {
            registry,
            resources,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Validate `def` against its kind's parameters and instantiate the unit.
    ///
    /// # Errors
    ///
    /// Unknown kinds, missing, unexpected, duplicated or mistyped parameters,
    /// and factory failures are reported at the definition's position.
    pub fn build(&self, def: &FunctionDefinition) -> Result<Box<dyn FunctionalUnit>, ValidationError> {
        let fail = |kind: ValidationErrorKind| ValidationError::new(kind, def.position, def.fragment.clone());
        let function = || def.kind.clone();

        let spec = self.registry.get(&def.kind).ok_or_else(|| {
            fail(ValidationErrorKind::UnknownFunction {
                name: def.kind.clone(),
            })
        })?;

        let mut values: BTreeMap<String, Value> = BTreeMap::new();

        for (i, arg) in def.arguments.iter().enumerate() {
            let param = spec.params.get(i).ok_or_else(|| {
                fail(ValidationErrorKind::UnexpectedParameter {
                    function: function(),
                    parameter: format!("#{}", i + 1),
                })
            })?;
            values.insert(param.name.clone(), arg.clone());
        }

        for (name, value) in &def.parameters {
            if spec.param(name).is_none() {
                return Err(fail(ValidationErrorKind::UnexpectedParameter {
                    function: function(),
                    parameter: name.clone(),
                }));
            }
            match values.entry(name.clone()) {
                Entry::Occupied(_) => {
                    return Err(fail(ValidationErrorKind::DuplicateParameter {
                        function: function(),
                        parameter: name.clone(),
                    }));
                }
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
            }
        }

        for param in &spec.params {
            match values.get(&param.name) {
                Some(value) if !value.is_null() => {
                    if !param.ty.accepts(value) {
                        return Err(fail(ValidationErrorKind::InvalidParameter {
                            function: function(),
                            parameter: param.name.clone(),
                            expected: param.ty.to_string(),
                            found: describe(value).to_string(),
                        }));
                    }
                }
                _ if param.required => {
                    return Err(fail(ValidationErrorKind::MissingParameter {
                        function: function(),
                        parameter: param.name.clone(),
                    }));
                }
                _ => {
                    if let Some(default) = &param.default {
                        values.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        let unit = spec
            .instantiate(&BoundParams::new(values), &self.resources)
            .map_err(|e| {
                fail(ValidationErrorKind::Binding {
                    function: function(),
                    reason: format!("{e:#}"),
                })
            })?;

        debug!(kind = %def.kind, index = def.position_in_chain, "Unit built");
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalCallError;
    use crate::runtime::context::ChainContext;
    use crate::spl::registry::{FunctionSpec, ParamSpec, ParamType};
    use crate::spl::unit::TokenSink;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug)]
    struct Echo {
        text: String,
    }

    #[async_trait]
    impl FunctionalUnit for Echo {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn run(&self, _ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
            Ok(self.text.clone())
        }
    }

    fn builder() -> FunctionalUnitBuilder {
        let mut registry = FunctionRegistry::new();
        registry.register(FunctionSpec::new(
            "echo",
            vec![
                ParamSpec::required("text", ParamType::String),
                ParamSpec::optional("times", ParamType::Integer).with_default(json!(1)),
            ],
            |params, _| {
                let text = params.str("text").unwrap_or_default();
                let times = params.usize("times").unwrap_or(1);
                Ok(Box::new(Echo { text: text.repeat(times) }))
            },
        ));
        FunctionalUnitBuilder::new(Arc::new(registry), UnitResources::default())
    }

    fn echo() -> FunctionDefinition {
        FunctionDefinition::new("echo", 0)
    }

    #[tokio::test]
    async fn test_positional_binding_and_default() {
        let mut def = echo();
        def.arguments.push(json!("hi"));
        let unit = builder().build(&def).unwrap();
        let out = unit
            .run(&mut ChainContext::new("q"), &TokenSink::discard())
            .await
            .unwrap();
        assert_eq!(out, "hi");

        let def = echo().with_param("text", json!("ab")).with_param("times", json!(3));
        let unit = builder().build(&def).unwrap();
        let out = unit
            .run(&mut ChainContext::new("q"), &TokenSink::discard())
            .await
            .unwrap();
        assert_eq!(out, "ababab");
    }

    #[test]
    fn test_parameter_errors() {
        let b = builder();

        let err = b.build(&echo()).unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::MissingParameter { ref parameter, .. } if parameter == "text"));

        let err = b.build(&echo().with_param("text", json!(1))).unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::InvalidParameter { ref found, .. } if found == "an integer"));

        let err = b
            .build(&echo().with_param("text", json!("a")).with_param("loud", json!(true)))
            .unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::UnexpectedParameter { .. }));

        let mut dup = echo().with_param("text", json!("a"));
        dup.arguments.push(json!("b"));
        let err = b.build(&dup).unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::DuplicateParameter { .. }));

        let mut extra = echo();
        extra.arguments.extend([json!("a"), json!(1), json!(2)]);
        let err = b.build(&extra).unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::UnexpectedParameter { ref parameter, .. } if parameter == "#3"));

        let err = b.build(&FunctionDefinition::new("nope", 0)).unwrap_err();
        assert!(matches!(err.kind, ValidationErrorKind::UnknownFunction { .. }));
    }

    #[test]
    fn test_builds_are_independent() {
        let b = builder();
        let def = echo().with_param("text", json!("x"));
        let first = b.build(&def).unwrap();
        let second = b.build(&def).unwrap();
        let a: *const dyn FunctionalUnit = first.as_ref();
        let c: *const dyn FunctionalUnit = second.as_ref();
        assert!(!std::ptr::addr_eq(a, c));
    }
}
