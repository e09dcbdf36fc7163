use serial_test::serial;
use spl_rag::config::CoreConfig;
use spl_rag::rag::ChunkingStrategy;
use spl_rag::spl::SplSyntax;
use std::env;
use std::fs;
use std::io::Write as _;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("SPLRAG_GRAPH__MAX_CONTEXT_TOKENS");
        env::remove_var("SPLRAG_RETRIEVAL__TOP_K");
        env::remove_var("CONFIG_FILE");
        env::remove_var("LOG_JSON");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = CoreConfig::load_from_args(["spl-rag"]).expect("Failed to load config");
    assert_eq!(config.chunking.strategy, ChunkingStrategy::regex(1000));
    assert_eq!(config.graph.max_context_tokens, 2000);
    assert_eq!(config.retrieval.top_k, 5);
    assert_eq!(config.embedding.batch_size, 32);
    assert!(config.ingestion.concurrency >= 1);
    assert_eq!(config.spl.syntax_for("json"), SplSyntax::Structured);
    assert_eq!(config.spl.syntax_for("anything-else"), SplSyntax::Call);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("SPLRAG_GRAPH__MAX_CONTEXT_TOKENS", "512");
        env::set_var("SPLRAG_RETRIEVAL__TOP_K", "9");
    }

    let config = CoreConfig::load_from_args(["spl-rag"]).expect("Failed to load config");
    assert_eq!(config.graph.max_context_tokens, 512);
    assert_eq!(config.retrieval.top_k, 9);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    write!(
        file,
        r#"
chunking:
  strategy:
    kind: fixed_words
    chunk_size: 50
graph:
  graph_level: 1
execution:
  max_attempts: 5
spl:
  agent_syntaxes:
    planner: prompt
"#
    )
    .unwrap();
    let path = file.path().to_str().unwrap().to_string();

    // Via the env var the --config flag reads
    unsafe {
        env::set_var("CONFIG_FILE", &path);
    }
    let config = CoreConfig::load_from_args(["spl-rag"]).expect("Failed to load config from file");
    assert_eq!(config.chunking.strategy, ChunkingStrategy::FixedWords { chunk_size: 50 });
    assert_eq!(config.graph.retrieval_config().graph_level, Some(1));
    assert_eq!(config.execution.retry_policy().max_attempts, 5);
    assert_eq!(config.spl.syntax_for("planner"), SplSyntax::Prompt);
    clear_env_vars();

    // And via the flag itself
    let config = CoreConfig::load_from_args(["spl-rag", "--config", &path]).expect("Failed to load config");
    assert_eq!(config.execution.max_attempts, 5);
}

#[test]
#[serial]
fn test_cli_overrides_env() {
    clear_env_vars();
    unsafe {
        env::set_var("SPLRAG_GRAPH__MAX_CONTEXT_TOKENS", "512");
    }

    let config = CoreConfig::load_from_args([
        "spl-rag",
        "--max-chunk-size",
        "64",
        "--max-context-tokens",
        "128",
        "--graph-level",
        "2",
    ])
    .expect("Failed to load config");
    assert_eq!(config.chunking.strategy, ChunkingStrategy::regex(64));
    assert_eq!(config.graph.max_context_tokens, 128);
    assert_eq!(config.graph.graph_level, Some(2));
    assert_eq!(config.unit_defaults().graph.graph_level, Some(2));

    clear_env_vars();
}

#[test]
#[serial]
fn test_invalid_args_rejected() {
    clear_env_vars();
    assert!(CoreConfig::load_from_args(["spl-rag", "--max-chunk-size", "lots"]).is_err());
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let config_content = r"
retrieval:
  top_k: 3
    ";
    let cwd_path = "config.yaml";
    fs::write(cwd_path, config_content).expect("Failed to write ./config.yaml");

    let config = CoreConfig::load_from_args(["spl-rag"]);

    fs::remove_file(cwd_path).unwrap();

    assert_eq!(config.expect("Failed to load config").retrieval.top_k, 3);
}
