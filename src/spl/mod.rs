//! SPL compiler and chain executor.
//!
//! ```text
//! (agent_type, spec) ──FunctionAnalyzer──▶ [FunctionDefinition]
//!                    ──FunctionalUnitBuilder──▶ [FunctionalUnit]  = SplChain
//! SplChain + ChainContext ──ChainExecutor──▶ Stream<ChainEvent>
//! ```
//!
//! Chains are compiled once per agent version ([`ChainCache`]) and shared
//! read-only by every request.

pub mod analyzer;
pub mod builder;
pub mod execute;
pub mod flow;
pub mod parser;
pub mod registry;
pub mod unit;
pub mod units;

pub use analyzer::{FunctionAnalyzer, SplConfig, SplSyntax};
pub use builder::{FunctionalUnitBuilder, UnitDefaults, UnitResources};
pub use execute::{ChainEvent, ChainEventStream, ChainExecutor, ExecutionOutcome};
pub use flow::{ChainCache, Compilation, CompilationState, MainFlowBuilder, SplChain};
pub use registry::{FunctionRegistry, FunctionSpec, ParamSpec, ParamType};
pub use unit::{BoundParams, FunctionalUnit, TokenSink};
