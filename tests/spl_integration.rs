//! Integration tests for SPL compilation and chain execution.
//!
//! These tests verify:
//! - Custom function kinds compile and run in spec order
//! - Failed compilations return no chain and leave other chains usable
//! - Built-in retrieve → prompt → chat chains stream an answer
//! - Cancellation and per-request isolation of compiled chains

use async_trait::async_trait;
use futures::StreamExt;
use spl_rag::domain::knowledge::TextUnit;
use spl_rag::error::{ExecutionError, ExternalCallError, ValidationErrorKind};
use spl_rag::llm::{ChatModel, ChatRequest, Embedder, MessageRole, TokenStream};
use spl_rag::rag::{EmbeddingAdapter, InMemoryKnowledge, SimilarityRanker};
use spl_rag::runtime::{ChainContext, RetryPolicy};
use spl_rag::spl::{
    ChainCache, ChainEvent, ChainExecutor, CompilationState, FunctionAnalyzer, FunctionRegistry, FunctionSpec,
    FunctionalUnit, FunctionalUnitBuilder, MainFlowBuilder, ParamSpec, ParamType, SplConfig, TokenSink,
    UnitResources,
};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Utilities
// =============================================================================

type Log = Arc<Mutex<Vec<String>>>;

/// Records its name in a shared log when run.
#[derive(Debug)]
struct Recorder {
    kind: String,
    log: Log,
}

#[async_trait]
impl FunctionalUnit for Recorder {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn run(&self, ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
        self.log.lock().unwrap().push(self.kind.clone());
        Ok(format!("{} after {}", self.kind, ctx.previous_output.as_deref().unwrap_or("start")))
    }
}

fn recording_registry(log: &Log) -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_builtins();
    for kind in ["step1", "step2", "step3"] {
        let log = Arc::clone(log);
        registry.register(FunctionSpec::new(
            kind,
            vec![ParamSpec::optional("label", ParamType::String)],
            move |_, _| {
                Ok(Box::new(Recorder {
                    kind: kind.to_string(),
                    log: Arc::clone(&log),
                }))
            },
        ));
    }
    registry
}

fn flow(registry: FunctionRegistry, resources: UnitResources) -> MainFlowBuilder {
    let registry = Arc::new(registry);
    MainFlowBuilder::new(
        FunctionAnalyzer::new(SplConfig::default(), Arc::clone(&registry)),
        FunctionalUnitBuilder::new(registry, resources),
    )
}

/// Streams a canned answer word by word and records the prompt it saw.
#[derive(Debug, Default)]
struct EchoChat {
    prompts: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl ChatModel for EchoChat {
    async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream, ExternalCallError> {
        self.prompts.lock().unwrap().push(request);
        let words = ["Paris ", "is ", "the ", "capital."];
        Ok(Box::pin(futures::stream::iter(words.map(|w| Ok(w.to_string())))))
    }
}

#[derive(Debug)]
struct TopicEmbedder;

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                vec![
                    f32::from(u8::from(t.contains("france") || t.contains("paris"))),
                    f32::from(u8::from(t.contains("rust"))),
                ]
            })
            .collect())
    }
}

fn knowledge() -> Arc<InMemoryKnowledge> {
    let adapter = EmbeddingAdapter::new(Arc::new(TopicEmbedder), 8, RetryPolicy::none());
    let units = vec![
        TextUnit::with_id("u1", "geo", "Paris is the capital of France.").with_embedding(vec![1.0, 0.0]),
        TextUnit::with_id("u2", "code", "Rust has no garbage collector.").with_embedding(vec![0.0, 1.0]),
    ];
    Arc::new(InMemoryKnowledge::new(units, SimilarityRanker::new(adapter, 100)))
}

// =============================================================================
// Compilation
// =============================================================================

#[tokio::test]
async fn test_two_step_chain_runs_in_order() {
    let log: Log = Arc::default();
    let flow = flow(recording_registry(&log), UnitResources::default());

    let chain = Arc::new(flow.build_main_flow("X", "step1(); step2();").unwrap());
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.kinds(), vec!["step1", "step2"]);

    let outcome = ChainExecutor::default()
        .run(chain, ChainContext::new("q"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["step1", "step2"]);
    assert_eq!(outcome.trace, vec!["step1", "step2"]);
    assert_eq!(outcome.answer, "step2 after step1 after start");
}

#[test]
fn test_order_preserved_for_permutations() {
    let log: Log = Arc::default();
    let flow = flow(recording_registry(&log), UnitResources::default());
    let orders = [
        ["step1", "step2", "step3"],
        ["step3", "step1", "step2"],
        ["step2", "step3", "step1"],
    ];
    for order in orders {
        let spec = order.map(|k| format!("{k}(label = \"{k}\")")).join("\n");
        let chain = flow.build_main_flow("X", &spec).unwrap();
        assert_eq!(chain.kinds(), order.to_vec());
    }
}

#[test]
fn test_compilation_fails_closed() {
    let log: Log = Arc::default();
    let flow = flow(recording_registry(&log), UnitResources::default());

    let (compilation, result) = flow.compile("X", "step1();\nstep9();\nstep2();");
    let err = result.unwrap_err();
    assert_eq!(compilation.state(), CompilationState::Failed);
    assert_eq!(
        err.kind,
        ValidationErrorKind::UnknownFunction {
            name: "step9".to_string()
        }
    );
    assert_eq!(err.position.line, 2);
    assert!(log.lock().unwrap().is_empty());

    // Builtins that need a collaborator fail at build time, with position.
    let err = flow.build_main_flow("X", "step1(); chat();").unwrap_err();
    assert!(matches!(err.kind, ValidationErrorKind::Binding { ref function, .. } if function == "chat"));
    assert_eq!(err.position.column, 10);

    let err = flow.build_main_flow("X", "step1(label = 3);").unwrap_err();
    assert!(matches!(err.kind, ValidationErrorKind::InvalidParameter { .. }));

    // Other specs still compile.
    assert!(flow.build_main_flow("X", "step1();").is_ok());
}

#[test]
fn test_negative_counts_fail_compilation() {
    let chat = Arc::new(EchoChat::default());
    let resources = UnitResources {
        chat: Some(chat as Arc<dyn ChatModel>),
        knowledge: Some(knowledge()),
        ..UnitResources::default()
    };
    let flow = flow(FunctionRegistry::with_builtins(), resources);

    let (compilation, result) = flow.compile("qa", "memory();\nretrieve(top_k = -1);");
    assert_eq!(compilation.state(), CompilationState::Failed);
    let err = result.unwrap_err();
    match err.kind {
        ValidationErrorKind::InvalidParameter {
            ref parameter,
            ref found,
            ..
        } => {
            assert_eq!(parameter, "top_k");
            assert_eq!(found, "a negative integer");
        }
        ref other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.position.line, 2);

    for spec in ["memory(window = -3);", "memory(mode = short, window = -1);"] {
        assert!(flow.build_main_flow("qa", spec).is_err(), "{spec}");
    }
    assert!(flow.build_main_flow("qa", "retrieve(top_k = 0);").is_ok());
}

// =============================================================================
// Execution with built-in units
// =============================================================================

#[tokio::test]
async fn test_retrieval_chain_streams_answer() {
    let chat = Arc::new(EchoChat::default());
    let resources = UnitResources {
        chat: Some(Arc::clone(&chat) as Arc<dyn ChatModel>),
        knowledge: Some(knowledge()),
        ..UnitResources::default()
    };
    let flow = flow(FunctionRegistry::with_builtins(), resources);
    let spec = r#"
        memory(mode = short)
        retrieve(top_k = 1)
        prompt(template = "Context:\n{context}\n\nQ: {query}", system = "Answer briefly.")
        chat(temperature = 0.0)
    "#;
    let chain = Arc::new(flow.build_main_flow("qa", spec).unwrap());

    let events: Vec<_> = ChainExecutor::default()
        .execute(chain, ChainContext::new("What is the capital of France?"), CancellationToken::new())
        .collect()
        .await;

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            ChainEvent::Token { index: 3, text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Paris is the capital.");
    match events.last() {
        Some(ChainEvent::Done { answer, trace, .. }) => {
            assert_eq!(answer, "Paris is the capital.");
            assert_eq!(trace, &vec!["memory", "retrieve", "prompt", "chat"]);
        }
        other => panic!("unexpected final event {other:?}"),
    }

    let prompts = chat.prompts.lock().unwrap();
    let request = &prompts[0];
    assert_eq!(request.messages[0].role, MessageRole::System);
    let user = &request.messages.last().unwrap().content;
    assert!(user.contains("Paris is the capital of France."), "{user}");
    assert!(!user.contains("garbage collector"));
    assert!(user.ends_with("Q: What is the capital of France?"));
}

#[tokio::test]
async fn test_prompt_syntax_without_matches_says_so() {
    let chat = Arc::new(EchoChat::default());
    let resources = UnitResources {
        chat: Some(Arc::clone(&chat) as Arc<dyn ChatModel>),
        knowledge: Some(knowledge()),
        ..UnitResources::default()
    };
    let flow = flow(FunctionRegistry::with_builtins(), resources);
    let chain = Arc::new(flow.build_main_flow("prompt", "Known facts: {context}").unwrap());
    assert_eq!(chain.kinds(), vec!["memory", "retrieve", "prompt", "chat"]);

    // The query shares no direction with any unit, so nothing is retrieved.
    ChainExecutor::default()
        .run(Arc::clone(&chain), ChainContext::new("tell me about cooking"), CancellationToken::new())
        .await
        .unwrap();

    let strict = Arc::new(
        flow.build_main_flow(
            "qa",
            "retrieve(min_score = 0.5); prompt(template = \"Facts: {context}\"); chat();",
        )
        .unwrap(),
    );
    ChainExecutor::default()
        .run(strict, ChainContext::new("Is Rust fast?"), CancellationToken::new())
        .await
        .unwrap();

    let prompts = chat.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert_eq!(
        prompts[0].messages.last().unwrap().content,
        "Known facts: No relevant context found."
    );
    assert!(prompts[1].messages.last().unwrap().content.contains("garbage collector"));
}

#[tokio::test]
async fn test_cancelled_request_leaves_chain_reusable() {
    let log: Log = Arc::default();
    let flow = flow(recording_registry(&log), UnitResources::default());
    let chain = Arc::new(flow.build_main_flow("X", "step1(); step2();").unwrap());
    let executor = ChainExecutor::default();

    let cancel = CancellationToken::new();
    let mut events = executor.execute(Arc::clone(&chain), ChainContext::new("q"), cancel.clone());
    let mut finished = 0;
    let mut last = None;
    while let Some(event) = events.next().await {
        if let ChainEvent::UnitFinished { .. } = event {
            finished += 1;
            cancel.cancel();
        }
        last = Some(event);
    }
    assert_eq!(finished, 1);
    assert_eq!(last, Some(ChainEvent::Cancelled { next_index: 1 }));
    assert_eq!(*log.lock().unwrap(), vec!["step1"]);

    let outcome = executor
        .run(chain, ChainContext::new("q"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.trace, vec!["step1", "step2"]);
}

#[tokio::test]
async fn test_concurrent_requests_share_cached_chain() {
    let log: Log = Arc::default();
    let cache = ChainCache::new(Arc::new(flow(recording_registry(&log), UnitResources::default())));
    let executor = ChainExecutor::default();

    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let chain = cache.get_or_compile("agent", 1, "X", "step1(); step2();").await?;
            let outcome = executor
                .run(chain, ChainContext::new(format!("q{i}")), CancellationToken::new())
                .await?;
            anyhow::Ok(outcome.trace)
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), vec!["step1", "step2"]);
    }
    assert_eq!(cache.len().await, 1);
    assert_eq!(log.lock().unwrap().len(), 16);

    let err = cache.get_or_compile("agent", 2, "X", "broken(").await.unwrap_err();
    assert!(matches!(err.kind, ValidationErrorKind::Syntax(_)));
    assert!(cache.get("agent", 1).await.is_some());
}

#[tokio::test]
async fn test_failed_unit_reports_index() {
    #[derive(Debug)]
    struct Down;

    #[async_trait]
    impl FunctionalUnit for Down {
        fn kind(&self) -> &str {
            "down"
        }

        async fn run(&self, _ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
            Err(ExternalCallError::fatal("model", "401 unauthorized"))
        }
    }

    let log: Log = Arc::default();
    let mut registry = recording_registry(&log);
    registry.register(FunctionSpec::new("down", Vec::new(), |_, _| Ok(Box::new(Down))));
    let flow = flow(registry, UnitResources::default());
    let chain = Arc::new(flow.build_main_flow("X", "step1(); down(); step2();").unwrap());

    let err = ChainExecutor::new(RetryPolicy::default())
        .run(chain, ChainContext::new("q"), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ExecutionError::Unit { index, kind, source } => {
            assert_eq!(index, 1);
            assert_eq!(kind, "down");
            assert!(!source.retryable);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(*log.lock().unwrap(), vec!["step1"]);
}
