//! Built-in function kinds.

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};

use crate::domain::knowledge::TextUnit;
use crate::error::ExternalCallError;
use crate::graph::{GraphContextBuilder, GraphRetrievalConfig, GraphRetriever, KnowledgeGraph};
use crate::llm::{ChatModel, ChatRequest, Message};
use crate::rag::embedding::EmbeddingAdapter;
use crate::rag::knowledge::KnowledgeSource;
use crate::rag::ranking::Scored;
use crate::rag::retrieval::{HybridRetriever, RetrievalSource, cited_unit_ids};
use crate::runtime::context::{ChainContext, MemoryFlags, RetrievedBlock};
use crate::runtime::history::HistoryManager;
use crate::runtime::retry::RetryPolicy;

use super::builder::UnitResources;
use super::registry::{FunctionRegistry, FunctionSpec, ParamSpec, ParamType};
use super::unit::{BoundParams, FunctionalUnit, TokenSink};

/// Template used by `prompt` when none is given.
pub const DEFAULT_TEMPLATE: &str = "Use the following context to answer the question.\n\n\
Context:\n{context}\n\nQuestion: {query}";

pub(super) fn register_builtins(registry: &mut FunctionRegistry) {
    registry
        .register(FunctionSpec::new(
            "memory",
            vec![
                ParamSpec::optional("mode", ParamType::String),
                ParamSpec::optional("window", ParamType::NonNegativeInteger),
            ],
            MemoryUnit::from_params,
        ))
        .register(FunctionSpec::new(
            "retrieve",
            vec![
                ParamSpec::optional("collection", ParamType::String),
                ParamSpec::optional("top_k", ParamType::NonNegativeInteger),
                ParamSpec::optional("min_score", ParamType::Number),
                ParamSpec::optional("query", ParamType::String),
                ParamSpec::optional("hybrid", ParamType::Bool).with_default(json!(false)),
                ParamSpec::optional("graph", ParamType::String),
            ],
            RetrieveUnit::from_params,
        ))
        .register(FunctionSpec::new(
            "graph_retrieve",
            vec![
                ParamSpec::optional("graph", ParamType::String),
                ParamSpec::optional("max_entities", ParamType::NonNegativeInteger),
                ParamSpec::optional("max_context_tokens", ParamType::NonNegativeInteger),
                ParamSpec::optional("graph_level", ParamType::NonNegativeInteger),
                ParamSpec::optional("use_embeddings", ParamType::Bool).with_default(json!(true)),
            ],
            GraphRetrieveUnit::from_params,
        ))
        .register(FunctionSpec::new(
            "prompt",
            vec![
                ParamSpec::optional("template", ParamType::String),
                ParamSpec::optional("system", ParamType::String),
            ],
            PromptUnit::from_params,
        ))
        .register(FunctionSpec::new(
            "chat",
            vec![
                ParamSpec::optional("model", ParamType::String),
                ParamSpec::optional("temperature", ParamType::Number),
            ],
            ChatUnit::from_params,
        ));
}

// =============================================================================
// memory
// =============================================================================

/// Admits conversation history into the context according to memory flags.
#[derive(Debug)]
pub struct MemoryUnit {
    flags: Option<MemoryFlags>,
    window: Option<usize>,
    history: HistoryManager,
}

impl MemoryUnit {
    fn from_params(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        let flags = match params.str("mode") {
            None => None,
            Some("none") => Some(MemoryFlags::default()),
            Some("short") => Some(MemoryFlags {
                short_term: true,
                long_term: false,
            }),
            Some("long") => Some(MemoryFlags {
                short_term: true,
                long_term: true,
            }),
            Some(other) => return Err(anyhow!("mode must be none, short or long, got `{other}`")),
        };
        Ok(Box::new(Self {
            flags,
            window: params.usize("window"),
            history: resources.history.clone(),
        }))
    }
}

#[async_trait]
impl FunctionalUnit for MemoryUnit {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn run(&self, ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
        let flags = self.flags.unwrap_or(ctx.memory);
        ctx.memory = flags;

        let mut history = if flags.long_term {
            ctx.raw_history.clone()
        } else if flags.short_term {
            self.history.apply(ctx.raw_history.clone()).0
        } else {
            Vec::new()
        };
        if let Some(window) = self.window {
            let skip = history.len().saturating_sub(window);
            history.drain(..skip);
        }
        ctx.history = history;
        Ok(format!("{} messages in memory", ctx.history.len()))
    }
}

// =============================================================================
// retrieve
// =============================================================================

/// Searches the knowledge source and appends ranked blocks to the context.
///
/// With `hybrid = true` the vector ranking is fused with the units cited by
/// the entities a graph retrieval selects for the same query.
#[derive(Debug)]
pub struct RetrieveUnit {
    knowledge: Arc<dyn KnowledgeSource>,
    collection: Option<String>,
    top_k: usize,
    min_score: f32,
    query: Option<String>,
    fusion: Option<GraphFusion>,
}

#[derive(Debug)]
struct GraphFusion {
    graph: Arc<KnowledgeGraph>,
    retriever: GraphRetriever,
    hybrid: HybridRetriever,
}

impl RetrieveUnit {
    fn from_params(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        let knowledge = resources
            .knowledge
            .clone()
            .context("no knowledge source configured")?;
        let fusion = if params.bool("hybrid").unwrap_or(false) {
            Some(GraphFusion {
                graph: select_graph(params, resources)?,
                retriever: GraphRetriever::new(resources.defaults.graph.clone()),
                hybrid: HybridRetriever::new(resources.defaults.hybrid.clone()),
            })
        } else {
            None
        };
        Ok(Box::new(Self {
            knowledge,
            collection: params.str("collection").map(ToString::to_string),
            top_k: params.usize("top_k").unwrap_or(resources.defaults.top_k),
            min_score: params.f32("min_score").unwrap_or(resources.defaults.min_score),
            query: params.str("query").map(ToString::to_string),
            fusion,
        }))
    }

    async fn fuse(
        &self,
        fusion: &GraphFusion,
        query: &str,
        ranked: Vec<Scored<TextUnit>>,
    ) -> Result<Vec<RetrievedBlock>, ExternalCallError> {
        let subgraph = fusion.retriever.retrieve(&fusion.graph, query, None);
        let ids = cited_unit_ids(subgraph.entities.iter().map(|s| &s.item));
        let cited = self.knowledge.units_by_id(&ids).await?;
        let cited: Vec<TextUnit> = cited
            .into_iter()
            .filter(|u| self.collection.as_deref().is_none_or(|c| u.source_collection_id == c))
            .collect();
        debug!(entities = subgraph.entities.len(), cited = cited.len(), "Fusing graph-cited units");

        let vector = ranked.into_iter().map(|s| s.item).collect();
        Ok(fusion
            .hybrid
            .fuse(vector, cited)
            .into_iter()
            .take(self.top_k)
            .map(|f| RetrievedBlock {
                origin: match f.source {
                    RetrievalSource::Vector => "retrieve",
                    RetrievalSource::Graph => "graph",
                    RetrievalSource::Both => "hybrid",
                }
                .to_string(),
                id: f.unit.id,
                content: f.unit.content,
                score: f.score,
            })
            .collect())
    }
}

#[async_trait]
impl FunctionalUnit for RetrieveUnit {
    fn kind(&self) -> &str {
        "retrieve"
    }

    async fn run(&self, ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
        let query = self.query.as_deref().unwrap_or(&ctx.query);
        let ranked: Vec<Scored<TextUnit>> = self
            .knowledge
            .search(self.collection.as_deref(), query, self.top_k)
            .await?
            .into_iter()
            .filter(|s| s.score > self.min_score)
            .collect();

        let blocks = match &self.fusion {
            Some(fusion) => self.fuse(fusion, query, ranked).await?,
            None => ranked
                .into_iter()
                .map(|s| RetrievedBlock {
                    id: s.item.id,
                    content: s.item.content,
                    score: s.score,
                    origin: "retrieve".to_string(),
                })
                .collect(),
        };

        let added = blocks.len();
        if added == 0 {
            debug!(request_id = %ctx.request_id, "No relevant units retrieved");
        }
        ctx.retrieved.extend(blocks);
        Ok(format!("{added} blocks retrieved"))
    }
}

/// The graph named by the `graph` parameter, else the only graph, else `default`.
fn select_graph(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Arc<KnowledgeGraph>> {
    match params.str("graph") {
        Some(name) => resources
            .graphs
            .get(name)
            .cloned()
            .with_context(|| format!("no graph named `{name}`")),
        None => match resources.graphs.len() {
            0 => Err(anyhow!("no knowledge graph configured")),
            1 => resources.graphs.values().next().cloned().context("no knowledge graph configured"),
            _ => resources
                .graphs
                .get("default")
                .cloned()
                .context("several graphs configured; name one with `graph`"),
        },
    }
}

// =============================================================================
// graph_retrieve
// =============================================================================

/// Retrieves a sub-graph and stores its rendered text in the context.
#[derive(Debug)]
pub struct GraphRetrieveUnit {
    graph: Arc<KnowledgeGraph>,
    retriever: GraphRetriever,
    renderer: GraphContextBuilder,
    embeddings: Option<EmbeddingAdapter>,
}

impl GraphRetrieveUnit {
    fn from_params(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        let graph = select_graph(params, resources)?;

        let defaults = &resources.defaults;
        let level = match params.usize("graph_level") {
            Some(level) => Some(u32::try_from(level).context("graph_level out of range")?),
            None => defaults.graph.graph_level,
        };
        let config = GraphRetrievalConfig {
            max_entities: params.usize("max_entities").unwrap_or(defaults.graph.max_entities),
            graph_level: level,
            ..defaults.graph.clone()
        };
        let max_tokens = params
            .usize("max_context_tokens")
            .unwrap_or(defaults.max_context_tokens);
        let embeddings = if params.bool("use_embeddings").unwrap_or(true) {
            resources.embeddings.clone()
        } else {
            None
        };

        Ok(Box::new(Self {
            graph,
            retriever: GraphRetriever::new(config),
            renderer: GraphContextBuilder::new(resources.tokens.clone(), max_tokens),
            embeddings,
        }))
    }
}

#[async_trait]
impl FunctionalUnit for GraphRetrieveUnit {
    fn kind(&self) -> &str {
        "graph_retrieve"
    }

    async fn run(&self, ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
        let has_vectors = self
            .graph
            .entities()
            .iter()
            .any(|e| e.attribute_embedding.is_some());
        let query_vector = match &self.embeddings {
            Some(adapter) if has_vectors => Some(adapter.embed_query(&ctx.query).await?),
            _ => None,
        };

        let subgraph = self
            .retriever
            .retrieve(&self.graph, &ctx.query, query_vector.as_deref());
        let rendered = self.renderer.render(&subgraph);
        info!(
            request_id = %ctx.request_id,
            entities = rendered.entities,
            relationships = rendered.relationships,
            reports = rendered.reports,
            tokens = rendered.tokens,
            "Graph context rendered"
        );
        let summary = format!(
            "{} entities, {} relationships, {} reports",
            rendered.entities, rendered.relationships, rendered.reports
        );
        ctx.graph_context = (!rendered.is_empty()).then_some(rendered.text);
        Ok(summary)
    }
}

// =============================================================================
// prompt
// =============================================================================

/// Renders a template into the messages sent to the chat model.
///
/// Placeholders: `{query}`, `{context}`, `{history}`, `{previous}`, `{graph}`,
/// and `{name}` for any context variable. Unknown placeholders are kept as-is.
#[derive(Debug)]
pub struct PromptUnit {
    template: String,
    system: Option<String>,
    placeholder: Regex,
}

impl PromptUnit {
    fn from_params(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        Ok(Box::new(Self {
            template: params.str("template").unwrap_or(DEFAULT_TEMPLATE).to_string(),
            system: params
                .str("system")
                .map(ToString::to_string)
                .or_else(|| resources.defaults.system_prompt.clone()),
            placeholder: Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")?,
        }))
    }

    fn render(&self, ctx: &ChainContext) -> String {
        self.placeholder
            .replace_all(&self.template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match name {
                    "query" => ctx.query.clone(),
                    "context" => ctx.knowledge_text(),
                    "history" => ctx.history_text(),
                    "previous" => ctx.previous_output.clone().unwrap_or_default(),
                    "graph" => ctx.graph_context.clone().unwrap_or_default(),
                    _ => ctx.variable_text(name).unwrap_or_else(|| caps[0].to_string()),
                }
            })
            .into_owned()
    }
}

#[async_trait]
impl FunctionalUnit for PromptUnit {
    fn kind(&self) -> &str {
        "prompt"
    }

    async fn run(&self, ctx: &mut ChainContext, _sink: &TokenSink) -> Result<String, ExternalCallError> {
        let rendered = self.render(ctx);
        let mut messages = Vec::with_capacity(ctx.history.len() + 2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(ctx.history.iter().cloned());
        messages.push(Message::user(rendered.clone()));
        ctx.prompt = messages;
        Ok(rendered)
    }
}

// =============================================================================
// chat
// =============================================================================

/// Streams an answer from the chat model, emitting each token.
///
/// Opening the stream is retried; a stream that fails after emitting tokens
/// is not, so the unit reports itself as non-idempotent.
#[derive(Debug)]
pub struct ChatUnit {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
    temperature: Option<f32>,
    retry: RetryPolicy,
}

impl ChatUnit {
    fn from_params(params: &BoundParams, resources: &UnitResources) -> anyhow::Result<Box<dyn FunctionalUnit>> {
        let chat = resources.chat.clone().context("no chat model configured")?;
        Ok(Box::new(Self {
            chat,
            model: params.str("model").map(ToString::to_string),
            temperature: params.f32("temperature").or(resources.defaults.temperature),
            retry: resources.defaults.chat_retry,
        }))
    }
}

#[async_trait]
impl FunctionalUnit for ChatUnit {
    fn kind(&self) -> &str {
        "chat"
    }

    fn idempotent(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut ChainContext, sink: &TokenSink) -> Result<String, ExternalCallError> {
        let messages = if ctx.prompt.is_empty() {
            let mut messages = ctx.history.clone();
            messages.push(Message::user(ctx.query.clone()));
            messages
        } else {
            ctx.prompt.clone()
        };
        let request = ChatRequest {
            messages,
            model: self.model.clone(),
            temperature: self.temperature,
        };

        let mut stream = self
            .retry
            .run("chat", || self.chat.stream_chat(request.clone()))
            .await?;

        let mut answer = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            answer.push_str(&token);
            sink.emit(token);
        }
        ctx.answer.clone_from(&answer);
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphImporter;
    use crate::llm::TokenStream;
    use crate::runtime::context::ChainContext;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct ScriptedChat {
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream, ExternalCallError> {
            if let Ok(mut seen) = self.requests.lock() {
                seen.push(request);
            }
            let tokens = vec![Ok("Hello".to_string()), Ok(", world".to_string())];
            Ok(Box::pin(futures::stream::iter(tokens)))
        }
    }

    #[derive(Debug)]
    struct StaticKnowledge;

    #[async_trait]
    impl KnowledgeSource for StaticKnowledge {
        async fn search(
            &self,
            collection: Option<&str>,
            _query: &str,
            top_k: usize,
        ) -> Result<Vec<Scored<TextUnit>>, ExternalCallError> {
            let all = vec![
                Scored {
                    item: TextUnit::with_id("u1", "kb", "Paris is the capital of France."),
                    score: 0.9,
                },
                Scored {
                    item: TextUnit::with_id("u2", "other", "Unrelated."),
                    score: 0.1,
                },
            ];
            Ok(all
                .into_iter()
                .filter(|s| collection.is_none_or(|c| s.item.source_collection_id == c))
                .take(top_k)
                .collect())
        }

        async fn units_by_id(&self, ids: &[String]) -> Result<Vec<TextUnit>, ExternalCallError> {
            let pool = [
                TextUnit::with_id("u1", "kb", "Paris is the capital of France."),
                TextUnit::with_id("u3", "kb", "Paris sits on the Seine."),
            ];
            Ok(ids
                .iter()
                .filter_map(|id| pool.iter().find(|u| &u.id == id).cloned())
                .collect())
        }
    }

    fn resources() -> UnitResources {
        let graph = GraphImporter::import_json(
            r#"{"entities": [{"id": "paris", "name": "Paris", "description": "capital city", "text_unit_ids": ["u3", "u1"]}]}"#,
        )
        .unwrap();
        UnitResources {
            chat: Some(Arc::new(ScriptedChat::default())),
            knowledge: Some(Arc::new(StaticKnowledge)),
            graphs: BTreeMap::from([("default".to_string(), Arc::new(graph))]),
            ..UnitResources::default()
        }
    }

    fn build(kind: &str, params: serde_json::Value) -> Box<dyn FunctionalUnit> {
        let registry = FunctionRegistry::with_builtins();
        let spec = registry.get(kind).unwrap();
        let values = serde_json::from_value(params).unwrap();
        spec.instantiate(&BoundParams::new(values), &resources()).unwrap()
    }

    #[tokio::test]
    async fn test_memory_modes() {
        let mut ctx = ChainContext::new("q");
        ctx.raw_history = (0..5).map(|i| Message::user(format!("m{i}"))).collect();

        build("memory", json!({})).run(&mut ctx, &TokenSink::discard()).await.unwrap();
        assert!(ctx.history.is_empty());

        build("memory", json!({"mode": "long", "window": 2}))
            .run(&mut ctx, &TokenSink::discard())
            .await
            .unwrap();
        let kept: Vec<_> = ctx.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(kept, vec!["m3", "m4"]);
        assert!(ctx.memory.long_term);
    }

    #[test]
    fn test_memory_rejects_unknown_mode() {
        let registry = FunctionRegistry::with_builtins();
        let values = serde_json::from_value(json!({"mode": "forever"})).unwrap();
        let err = registry
            .get("memory")
            .unwrap()
            .instantiate(&BoundParams::new(values), &resources())
            .unwrap_err();
        assert!(err.to_string().contains("forever"));
    }

    #[tokio::test]
    async fn test_retrieve_appends_blocks() {
        let mut ctx = ChainContext::new("capital of France");
        let out = build("retrieve", json!({"collection": "kb", "min_score": 0.5}))
            .run(&mut ctx, &TokenSink::discard())
            .await
            .unwrap();
        assert_eq!(out, "1 blocks retrieved");
        assert_eq!(ctx.retrieved[0].id, "u1");
        assert!(ctx.knowledge_text().contains("Paris is the capital"));
    }

    #[tokio::test]
    async fn test_hybrid_retrieve_fuses_graph_citations() {
        let mut ctx = ChainContext::new("Tell me about Paris");
        build("retrieve", json!({"collection": "kb", "hybrid": true}))
            .run(&mut ctx, &TokenSink::discard())
            .await
            .unwrap();
        let got: Vec<_> = ctx
            .retrieved
            .iter()
            .map(|b| (b.id.as_str(), b.origin.as_str()))
            .collect();
        assert_eq!(got, vec![("u1", "hybrid"), ("u3", "graph")]);
    }

    #[tokio::test]
    async fn test_graph_retrieve_sets_context() {
        let mut ctx = ChainContext::new("Tell me about Paris");
        build("graph_retrieve", json!({}))
            .run(&mut ctx, &TokenSink::discard())
            .await
            .unwrap();
        let graph = ctx.graph_context.unwrap();
        assert!(graph.contains("paris|Paris|unknown|capital city"));

        let mut ctx = ChainContext::new("nothing matches");
        build("graph_retrieve", json!({}))
            .run(&mut ctx, &TokenSink::discard())
            .await
            .unwrap();
        assert!(ctx.graph_context.is_none());
    }

    #[tokio::test]
    async fn test_prompt_renders_placeholders() {
        let mut ctx = ChainContext::new("Why?");
        ctx.variables.insert("tone".into(), json!("formal"));
        ctx.previous_output = Some("prev".into());
        let unit = build(
            "prompt",
            json!({"template": "Q={query} C={context} T={tone} P={previous} X={unknown}", "system": "Be brief."}),
        );
        let out = unit.run(&mut ctx, &TokenSink::discard()).await.unwrap();
        assert_eq!(
            out,
            "Q=Why? C=No relevant context found. T=formal P=prev X={unknown}"
        );
        assert_eq!(ctx.prompt.len(), 2);
        assert_eq!(ctx.prompt[0].content, "Be brief.");
    }

    #[tokio::test]
    async fn test_chat_streams_tokens() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = ChainContext::new("hi");
        let unit = build("chat", json!({"temperature": 0.1}));
        assert!(!unit.idempotent());

        let answer = unit.run(&mut ctx, &TokenSink::new(tx)).await.unwrap();
        assert_eq!(answer, "Hello, world");
        assert_eq!(ctx.answer, "Hello, world");
        assert_eq!(rx.recv().await.as_deref(), Some("Hello"));
        assert_eq!(rx.recv().await.as_deref(), Some(", world"));
    }

    #[test]
    fn test_missing_collaborators_fail_binding() {
        let registry = FunctionRegistry::with_builtins();
        let bare = UnitResources::default();
        for kind in ["retrieve", "graph_retrieve", "chat"] {
            let result = registry
                .get(kind)
                .unwrap()
                .instantiate(&BoundParams::default(), &bare);
            assert!(result.is_err(), "{kind} should need a collaborator");
        }
    }
}
