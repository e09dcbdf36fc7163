use crate::graph::GraphRetrievalConfig;
use crate::llm::LlmSettings;
use crate::rag::chunking::ChunkingStrategy;
use crate::rag::retrieval::HybridRetrieverConfig;
use crate::runtime::history::HistoryConfig;
use crate::runtime::retry::RetryPolicy;
use crate::spl::analyzer::SplConfig;
use crate::spl::builder::UnitDefaults;
use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fallback config file picked up from the working directory.
const CWD_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    pub config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    /// Override the chunker's maximum chunk size
    #[arg(long, global = true)]
    pub max_chunk_size: Option<usize>,

    /// Override the token budget of rendered graph context
    #[arg(long, global = true)]
    pub max_context_tokens: Option<usize>,

    /// Restrict graph retrieval to communities at this level
    #[arg(long, global = true)]
    pub graph_level: Option<u32>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Chunk a text file and print the chunks as JSON
    Chunk {
        #[arg(long)]
        file: PathBuf,
    },
    /// Import a graph and print the context rendered for a query
    Graph {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        query: String,
    },
    /// Compile an agent spec and print its unit kinds
    Compile {
        #[arg(long)]
        agent_type: String,
        #[arg(long)]
        spec_file: PathBuf,
    },
    /// Ingest documents, compile a spec and stream an answer
    Run {
        #[arg(long)]
        agent_type: String,
        #[arg(long)]
        spec_file: PathBuf,
        #[arg(long)]
        query: String,
        /// Documents to ingest into the in-memory knowledge base
        #[arg(long = "docs", num_args = 1..)]
        docs: Vec<PathBuf>,
        /// Knowledge graph JSON made available to `graph_retrieve`
        #[arg(long)]
        graph: Option<PathBuf>,
    },
}

/// Everything the core needs, built once at start-up and passed by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
    pub context: HistoryConfig,
    pub execution: ExecutionConfig,
    pub ingestion: IngestionConfig,
    pub spl: SplConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Local fastembed model
    #[default]
    Local,
    /// OpenAI-compatible `/v1/embeddings` endpoint (uses the `LLM_*` settings)
    Openai,
    /// No embeddings; retrieval falls back to lexical graph matching
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Embedding model name for the remote provider.
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: None,
            dimensions: None,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_score: f32,
    /// Candidate count above which ranking moves to the blocking pool.
    pub blocking_threshold: usize,
    pub hybrid: HybridRetrieverConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
            blocking_threshold: 2048,
            hybrid: HybridRetrieverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub max_context_tokens: usize,
    pub graph_level: Option<u32>,
    pub retrieval: GraphRetrievalConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 2000,
            graph_level: None,
            retrieval: GraphRetrievalConfig::default(),
        }
    }
}

impl GraphConfig {
    /// Retrieval settings with the section-level `graph_level` applied.
    pub fn retrieval_config(&self) -> GraphRetrievalConfig {
        GraphRetrievalConfig {
            graph_level: self.graph_level.or(self.retrieval.graph_level),
            ..self.retrieval.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            temperature: None,
            system_prompt: None,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Documents processed at once.
    pub concurrency: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
        }
    }
}

impl CoreConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    /// Layering: defaults, then the config file, then `SPLRAG_` environment
    /// variables (`SPLRAG_GRAPH__MAX_CONTEXT_TOKENS=500`), then CLI flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("chunking.strategy.kind", "regex")?
            .set_default("chunking.strategy.max_chunk_size", 1000)?;

        match &cli.config {
            Some(path) => {
                builder = builder.add_source(File::with_name(path));
            }
            None if Path::new(CWD_CONFIG).exists() => {
                builder = builder.add_source(File::with_name(CWD_CONFIG));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("SPLRAG")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(size) = cli.max_chunk_size {
            builder = builder.set_override(
                "chunking.strategy.max_chunk_size",
                u64::try_from(size).unwrap_or(u64::MAX),
            )?;
        }
        if let Some(tokens) = cli.max_context_tokens {
            builder = builder.set_override(
                "graph.max_context_tokens",
                u64::try_from(tokens).unwrap_or(u64::MAX),
            )?;
        }
        if let Some(level) = cli.graph_level {
            builder = builder.set_override("graph.graph_level", u64::from(level))?;
        }

        let cfg = builder.build()?;
        let config: Self = cfg.try_deserialize()?;
        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Defaults handed to built-in units.
    pub fn unit_defaults(&self) -> UnitDefaults {
        UnitDefaults {
            top_k: self.retrieval.top_k,
            min_score: self.retrieval.min_score,
            graph: self.graph.retrieval_config(),
            hybrid: self.retrieval.hybrid.clone(),
            max_context_tokens: self.graph.max_context_tokens,
            temperature: self.execution.temperature,
            system_prompt: self.execution.system_prompt.clone(),
            chat_retry: self.execution.retry_policy(),
        }
    }
}

fn required_env(name: &str) -> Result<String, String> {
    std::env::var(name)
        .ok()
        .ok_or_else(|| format!("Missing required env var: {name}"))
        .and_then(|value| {
            if value.trim().is_empty() {
                Err(format!("{name} cannot be empty"))
            } else {
                Ok(value)
            }
        })
}

/// Chat endpoint settings from `LLM_BASE_URL`, `LLM_MODEL` and `LLM_API_KEY`.
pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let base_url = required_env("LLM_BASE_URL")?;
    let model = required_env("LLM_MODEL")?;
    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
    })
}
