//! `spl-rag` command-line driver.
//!
//! Thin wrapper over the library: chunk files, render graph context, compile
//! agent specs, and run a compiled chain against an OpenAI-compatible endpoint.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use clap::{CommandFactory, Parser};
use dotenvy::dotenv;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spl_rag::config::{Cli, Command, CoreConfig, EmbeddingProvider, load_llm_settings};
use spl_rag::domain::knowledge::{SourceDocument, TextUnit};
use spl_rag::graph::{GraphContextBuilder, GraphImporter, GraphRetriever, KnowledgeGraph, RawGraph};
use spl_rag::llm::embeddings::{FastEmbedder, OpenAiEmbedder};
use spl_rag::llm::{ChatCompletionsDriver, Embedder, LlmSettings};
use spl_rag::rag::{Chunker, EmbeddingAdapter, InMemoryKnowledge, IngestPipeline, SimilarityRanker};
use spl_rag::runtime::{ContextBuilder, ContextRequest, HistoryManager, TokenService};
use spl_rag::spl::{
    ChainEvent, ChainExecutor, FunctionAnalyzer, FunctionRegistry, FunctionalUnitBuilder, MainFlowBuilder,
    UnitResources,
};
use spl_rag::{runtime::context::NO_CONTEXT, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    let config = CoreConfig::from_cli(&cli).context("loading configuration")?;

    let Some(command) = cli.command.clone() else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Chunk { file } => chunk(&config, &file).await,
        Command::Graph { file, query } => graph(&config, &file, &query).await,
        Command::Compile {
            agent_type,
            spec_file,
        } => compile(&config, &agent_type, &spec_file).await,
        Command::Run {
            agent_type,
            spec_file,
            query,
            docs,
            graph,
        } => run(&config, &agent_type, &spec_file, &query, docs, graph).await,
    }
}

async fn read(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

async fn chunk(config: &CoreConfig, file: &Path) -> anyhow::Result<()> {
    let text = read(file).await?;
    let chunker = Chunker::new(config.chunking.strategy.clone())?;
    let chunks = tokio::task::spawn_blocking(move || chunker.chunk(&text)).await?;
    info!(file = %file.display(), chunk_count = chunks.len(), "File chunked");
    println!("{}", serde_json::to_string_pretty(&chunks)?);
    Ok(())
}

async fn graph(config: &CoreConfig, file: &Path, query: &str) -> anyhow::Result<()> {
    let graph = GraphImporter::import_json(&read(file).await?)?;
    let subgraph = GraphRetriever::new(config.graph.retrieval_config()).retrieve(&graph, query, None);
    let rendered = GraphContextBuilder::new(TokenService::new(), config.graph.max_context_tokens).render(&subgraph);
    info!(
        entities = rendered.entities,
        relationships = rendered.relationships,
        reports = rendered.reports,
        tokens = rendered.tokens,
        truncated = rendered.truncated,
        "Graph context rendered"
    );
    if rendered.is_empty() {
        println!("{NO_CONTEXT}");
    } else {
        println!("{}", rendered.text);
    }
    Ok(())
}

async fn compile(config: &CoreConfig, agent_type: &str, spec_file: &Path) -> anyhow::Result<()> {
    let spec = read(spec_file).await?;
    let llm = load_llm_settings().ok();
    let embeddings = embedding_adapter(config, llm.as_ref());
    let resources = resources(config, llm, embeddings, Vec::new(), None);
    let chain = flow(config, resources).build_main_flow(agent_type, &spec)?;
    for (index, kind) in chain.kinds().iter().enumerate() {
        println!("{index}: {kind}");
    }
    Ok(())
}

async fn run(
    config: &CoreConfig,
    agent_type: &str,
    spec_file: &Path,
    query: &str,
    docs: Vec<PathBuf>,
    graph_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let spec = read(spec_file).await?;
    let settings = load_llm_settings().map_err(|msg| anyhow!("Configuration error: {msg}"))?;
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let embeddings = embedding_adapter(config, Some(&settings));

    let mut documents = Vec::with_capacity(docs.len());
    for path in &docs {
        let mut document = SourceDocument::new("cli", read(path).await?);
        document.name = Some(path.display().to_string());
        documents.push(document);
    }
    let pipeline = IngestPipeline::new(
        Chunker::new(config.chunking.strategy.clone())?,
        embeddings.clone(),
        config.ingestion.concurrency,
    );
    let mut units = Vec::new();
    for (path, result) in docs.iter().zip(pipeline.ingest_batch(documents).await) {
        match result {
            Ok(ingested) => units.extend(ingested),
            Err(e) => warn!(document = %path.display(), error = %e, "Document skipped"),
        }
    }

    let graph = match graph_file {
        Some(path) => {
            let raw: RawGraph = serde_json::from_str(&read(&path).await?)
                .with_context(|| format!("parsing {}", path.display()))?;
            Some(match &embeddings {
                Some(adapter) => GraphImporter::import_with_embeddings(raw, adapter).await?,
                None => GraphImporter::import(raw)?,
            })
        }
        None => None,
    };

    let resources = resources(config, Some(settings), embeddings, units, graph);
    let history = resources.history.clone();
    let chain = Arc::new(flow(config, resources).build_main_flow(agent_type, &spec)?);

    let ctx = ContextBuilder::new(history).build(ContextRequest {
        query: query.to_string(),
        ..ContextRequest::default()
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let executor = ChainExecutor::new(config.execution.retry_policy());
    let mut events = executor.execute(chain, ctx, cancel);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            ChainEvent::Token { text, .. } => {
                print!("{text}");
                stdout.flush()?;
            }
            ChainEvent::Failed { error } => return Err(error.into()),
            ChainEvent::Cancelled { next_index } => {
                eprintln!("\ncancelled before unit {next_index}");
                return Ok(());
            }
            ChainEvent::Done { answer, trace, .. } => {
                println!();
                info!(answer_len = answer.len(), trace = ?trace, "Done");
            }
            _ => {}
        }
    }
    Ok(())
}

fn embedding_adapter(config: &CoreConfig, llm: Option<&LlmSettings>) -> Option<EmbeddingAdapter> {
    let embedder: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProvider::Disabled => return None,
        EmbeddingProvider::Local => Arc::new(FastEmbedder::default()),
        EmbeddingProvider::Openai => {
            let Some(settings) = llm else {
                warn!("OpenAI embeddings need LLM_BASE_URL and LLM_MODEL; embeddings disabled");
                return None;
            };
            let mut settings = settings.clone();
            if let Some(model) = &config.embedding.model {
                settings.model.clone_from(model);
            }
            Arc::new(OpenAiEmbedder::new(settings, config.embedding.dimensions))
        }
    };
    Some(EmbeddingAdapter::new(
        embedder,
        config.embedding.batch_size,
        config.execution.retry_policy(),
    ))
}

fn resources(
    config: &CoreConfig,
    llm: Option<LlmSettings>,
    embeddings: Option<EmbeddingAdapter>,
    units: Vec<TextUnit>,
    graph: Option<KnowledgeGraph>,
) -> UnitResources {
    let tokens = TokenService::new();
    let mut resources = UnitResources {
        history: HistoryManager::new(config.context.clone(), tokens.clone()),
        tokens,
        defaults: config.unit_defaults(),
        embeddings: embeddings.clone(),
        ..UnitResources::default()
    };
    if let Some(settings) = llm {
        resources.chat = Some(Arc::new(ChatCompletionsDriver::new(settings)));
    }
    if let Some(adapter) = embeddings {
        let ranker = SimilarityRanker::new(adapter, config.retrieval.blocking_threshold);
        resources.knowledge = Some(Arc::new(InMemoryKnowledge::new(units, ranker)));
    }
    if let Some(graph) = graph {
        resources.graphs.insert("default".to_string(), Arc::new(graph));
    }
    resources
}

fn flow(config: &CoreConfig, resources: UnitResources) -> MainFlowBuilder {
    let registry = Arc::new(FunctionRegistry::with_builtins());
    MainFlowBuilder::new(
        FunctionAnalyzer::new(config.spl.clone(), Arc::clone(&registry)),
        FunctionalUnitBuilder::new(registry, resources),
    )
}
