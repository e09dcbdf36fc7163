//! Main flow builder: drives analysis and unit building into a compiled chain,
//! plus the per-agent-version chain cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::domain::function::FunctionDefinition;
use crate::error::{SourcePosition, ValidationError, ValidationErrorKind};

use super::analyzer::FunctionAnalyzer;
use super::builder::FunctionalUnitBuilder;
use super::unit::FunctionalUnit;

/// Compilation lifecycle. `Compiled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationState {
    Uncompiled,
    Analyzing,
    Building,
    Compiled,
    Failed,
}

impl CompilationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Compiled | Self::Failed)
    }
}

impl fmt::Display for CompilationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uncompiled => "uncompiled",
            Self::Analyzing => "analyzing",
            Self::Building => "building",
            Self::Compiled => "compiled",
            Self::Failed => "failed",
        })
    }
}

/// The compiled, ordered chain of units for one agent spec.
///
/// Shared read-only across concurrent executions.
#[derive(Debug)]
pub struct SplChain {
    pub agent_type: String,
    pub units: Vec<Box<dyn FunctionalUnit>>,
    pub definitions: Vec<FunctionDefinition>,
    pub compiled_at: DateTime<Utc>,
}

impl SplChain {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Unit kinds in execution order.
    pub fn kinds(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.kind()).collect()
    }
}

/// One run of the compilation state machine.
///
/// Recompiling means starting a new `Compilation`; a finished one only
/// reports its outcome.
#[derive(Debug)]
pub struct Compilation {
    agent_type: String,
    state: CompilationState,
    error: Option<ValidationError>,
}

impl Compilation {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            state: CompilationState::Uncompiled,
            error: None,
        }
    }

    pub fn state(&self) -> CompilationState {
        self.state
    }

    /// The first error encountered, once `Failed`.
    pub fn error(&self) -> Option<&ValidationError> {
        self.error.as_ref()
    }

    fn advance(&mut self, next: CompilationState) {
        tracing::debug!(agent_type = %self.agent_type, from = %self.state, to = %next, "Compilation state");
        self.state = next;
    }

    fn fail(&mut self, error: ValidationError) -> ValidationError {
        warn!(agent_type = %self.agent_type, from = %self.state, %error, "Compilation failed");
        self.state = CompilationState::Failed;
        self.error = Some(error.clone());
        error
    }

    /// Run analysis then building. A failure leaves no partial chain.
    pub fn run(&mut self, flow: &MainFlowBuilder, spec: &str) -> Result<SplChain, ValidationError> {
        if self.state.is_terminal() {
            return Err(match &self.error {
                Some(e) => e.clone(),
                None => ValidationError::new(
                    ValidationErrorKind::Syntax(format!("compilation already {}", self.state)),
                    SourcePosition::default(),
                    "",
                ),
            });
        }

        self.advance(CompilationState::Analyzing);
        let definitions = match flow.analyzer.analyze(&self.agent_type, spec) {
            Ok(defs) => defs,
            Err(e) => return Err(self.fail(e)),
        };

        self.advance(CompilationState::Building);
        let mut units = Vec::with_capacity(definitions.len());
        for def in &definitions {
            match flow.builder.build(def) {
                Ok(unit) => units.push(unit),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.advance(CompilationState::Compiled);
        Ok(SplChain {
            agent_type: self.agent_type.clone(),
            units,
            definitions,
            compiled_at: Utc::now(),
        })
    }
}

/// Analyze → build, in definition order.
#[derive(Debug, Clone)]
pub struct MainFlowBuilder {
    analyzer: FunctionAnalyzer,
    builder: FunctionalUnitBuilder,
}

impl MainFlowBuilder {
    pub fn new(analyzer: FunctionAnalyzer, builder: FunctionalUnitBuilder) -> Self {
        Self { analyzer, builder }
    }

    pub fn analyzer(&self) -> &FunctionAnalyzer {
        &self.analyzer
    }

    /// Compile and return the state machine along with the outcome.
    pub fn compile(&self, agent_type: &str, spec: &str) -> (Compilation, Result<SplChain, ValidationError>) {
        let mut compilation = Compilation::new(agent_type);
        let result = compilation.run(self, spec);
        (compilation, result)
    }

    /// Compile `spec` into an executable chain.
    ///
    /// # Errors
    ///
    /// The first [`ValidationError`] from analysis or building.
    #[instrument(skip(self, spec), fields(spec_len = spec.len()))]
    pub fn build_main_flow(&self, agent_type: &str, spec: &str) -> Result<SplChain, ValidationError> {
        let chain = self.compile(agent_type, spec).1?;
        info!(units = chain.len(), kinds = ?chain.kinds(), "Chain compiled");
        Ok(chain)
    }
}

/// Compiled chains keyed by agent id and version.
///
/// Only successful compilations are stored. Storing a new version of an
/// agent drops its older versions.
#[derive(Debug, Clone)]
pub struct ChainCache {
    flow: Arc<MainFlowBuilder>,
    chains: Arc<RwLock<HashMap<(String, u64), Arc<SplChain>>>>,
}

impl ChainCache {
    pub fn new(flow: Arc<MainFlowBuilder>) -> Self {
        Self {
            flow,
            chains: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, agent_id: &str, version: u64) -> Option<Arc<SplChain>> {
        self.chains
            .read()
            .await
            .get(&(agent_id.to_string(), version))
            .map(Arc::clone)
    }

    /// Return the cached chain for this agent version, compiling it on a miss.
    ///
    /// # Errors
    ///
    /// The compilation error; nothing is cached in that case.
    ///
    /// Only the newest version of an agent is kept. Asking for an older
    /// version than the one cached compiles it without storing it.
    #[instrument(skip(self, spec))]
    pub async fn get_or_compile(
        &self,
        agent_id: &str,
        version: u64,
        agent_type: &str,
        spec: &str,
    ) -> Result<Arc<SplChain>, ValidationError> {
        if let Some(chain) = self.get(agent_id, version).await {
            tracing::debug!("Chain cache hit");
            return Ok(chain);
        }

        let chain = Arc::new(self.flow.build_main_flow(agent_type, spec)?);

        let mut chains = self.chains.write().await;
        // A concurrent caller may have compiled the same version meanwhile.
        if let Some(existing) = chains.get(&(agent_id.to_string(), version)) {
            return Ok(Arc::clone(existing));
        }
        if chains.keys().any(|(id, v)| id == agent_id && *v > version) {
            tracing::debug!("Newer version cached; older chain not stored");
            return Ok(chain);
        }
        let before = chains.len();
        chains.retain(|(id, v), _| id != agent_id || *v > version);
        if chains.len() < before {
            info!(evicted = before - chains.len(), "Older chain versions evicted");
        }
        chains.insert((agent_id.to_string(), version), Arc::clone(&chain));
        Ok(chain)
    }

    /// Drop every cached version of `agent_id`.
    pub async fn invalidate(&self, agent_id: &str) {
        self.chains.write().await.retain(|(id, _), _| id != agent_id);
    }

    pub async fn len(&self) -> usize {
        self.chains.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalCallError;
    use crate::runtime::context::ChainContext;
    use crate::spl::analyzer::SplConfig;
    use crate::spl::builder::UnitResources;
    use crate::spl::registry::{FunctionRegistry, FunctionSpec};
    use crate::spl::unit::TokenSink;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Step(String);

    #[async_trait]
    impl FunctionalUnit for Step {
        fn kind(&self) -> &str {
            &self.0
        }

        async fn run(&self, _ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
            Ok(self.0.clone())
        }
    }

    fn flow() -> MainFlowBuilder {
        let mut registry = FunctionRegistry::new();
        for kind in ["a", "b", "c"] {
            registry.register(FunctionSpec::new(kind, Vec::new(), move |_, _| {
                Ok(Box::new(Step(kind.to_string())))
            }));
        }
        let registry = Arc::new(registry);
        MainFlowBuilder::new(
            FunctionAnalyzer::new(SplConfig::default(), Arc::clone(&registry)),
            FunctionalUnitBuilder::new(registry, UnitResources::default()),
        )
    }

    #[test]
    fn test_compiles_in_order() {
        let (compilation, result) = flow().compile("X", "c(); a(); b();");
        let chain = result.unwrap();
        assert_eq!(compilation.state(), CompilationState::Compiled);
        assert_eq!(chain.kinds(), vec!["c", "a", "b"]);
        assert_eq!(chain.definitions.len(), 3);
    }

    #[test]
    fn test_fails_closed() {
        let (compilation, result) = flow().compile("X", "a(); missing(); b();");
        assert!(result.is_err());
        assert_eq!(compilation.state(), CompilationState::Failed);
        assert!(matches!(
            compilation.error().map(|e| &e.kind),
            Some(ValidationErrorKind::UnknownFunction { .. })
        ));

        let (compilation, result) = flow().compile("X", "a(unexpected = 1);");
        assert!(result.is_err());
        assert_eq!(compilation.state(), CompilationState::Failed);
    }

    #[test]
    fn test_finished_compilation_is_not_rerun() {
        let flow = flow();
        let (mut compilation, _) = flow.compile("X", "a();");
        assert!(compilation.run(&flow, "a();").is_err());
        assert_eq!(compilation.state(), CompilationState::Compiled);
    }

    #[tokio::test]
    async fn test_cache_versions() {
        let cache = ChainCache::new(Arc::new(flow()));

        let v1 = cache.get_or_compile("agent", 1, "X", "a();").await.unwrap();
        let again = cache.get_or_compile("agent", 1, "X", "b();").await.unwrap();
        assert!(Arc::ptr_eq(&v1, &again));

        let v2 = cache.get_or_compile("agent", 2, "X", "b();").await.unwrap();
        assert_eq!(v2.kinds(), vec!["b"]);
        assert!(cache.get("agent", 1).await.is_none());
        assert_eq!(cache.len().await, 1);

        let stale = cache.get_or_compile("agent", 1, "X", "a();").await.unwrap();
        assert_eq!(stale.kinds(), vec!["a"]);
        assert!(cache.get("agent", 1).await.is_none());
        assert!(cache.get("agent", 2).await.is_some());
        assert_eq!(cache.len().await, 1);

        assert!(cache.get_or_compile("agent", 3, "X", "nope();").await.is_err());
        assert!(cache.get("agent", 3).await.is_none());
        assert!(cache.get("agent", 2).await.is_some());

        cache.invalidate("agent").await;
        assert_eq!(cache.len().await, 0);
    }
}
