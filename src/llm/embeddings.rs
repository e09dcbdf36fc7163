//! Embedding model collaborators.

use crate::error::ExternalCallError;
use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::LlmSettings;

const COLLABORATOR: &str = "embedder";

/// Turns texts into vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError>;

    /// Vector dimension, when known up front.
    fn dimensions(&self) -> Option<usize> {
        None
    }
}

// =============================================================================
// Local fastembed model
// =============================================================================

/// Local ONNX embedding model (BGE-Small-En-V1.5 by default).
///
/// The model is loaded lazily on first use and runs on the blocking pool.
pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    kind: FastEmbedModel,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Default for FastEmbedder {
    fn default() -> Self {
        Self::new(FastEmbedModel::BGESmallENV15)
    }
}

impl FastEmbedder {
    pub fn new(kind: FastEmbedModel) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            kind,
        }
    }

    async fn load(&self, guard: &mut Option<TextEmbedding>) -> Result<(), ExternalCallError> {
        if guard.is_some() {
            return Ok(());
        }
        info!(model = ?self.kind, "Initializing fastembed model...");
        let options = InitOptions::new(self.kind.clone());
        let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
            .await
            .map_err(|e| ExternalCallError::fatal(COLLABORATOR, e))?
            .map_err(|e| ExternalCallError::fatal(COLLABORATOR, e))?;
        *guard = Some(model);
        Ok(())
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model_guard = self.model.lock().await;
        self.load(&mut model_guard).await?;

        let mut owned_model = model_guard
            .take()
            .ok_or_else(|| ExternalCallError::fatal(COLLABORATOR, "model unexpectedly unloaded"))?;

        let (embeddings_res, returned_model) = tokio::task::spawn_blocking(move || {
            let res = owned_model.embed(texts, None);
            (res, owned_model)
        })
        .await
        .map_err(|e| ExternalCallError::fatal(COLLABORATOR, e))?;

        // Put the model back
        *model_guard = Some(returned_model);
        embeddings_res.map_err(|e| ExternalCallError::retryable(COLLABORATOR, e))
    }
}

// =============================================================================
// OpenAI-compatible HTTP embeddings
// =============================================================================

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    settings: LlmSettings,
    dimensions: Option<usize>,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(settings: LlmSettings, dimensions: Option<usize>) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ExternalCallError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();
        let url = format!(
            "{}/v1/embeddings",
            self.settings.base_url.trim_end_matches('/')
        );
        let mut body = serde_json::json!({ "model": self.settings.model, "input": texts });
        if let Some(d) = self.dimensions {
            body["dimensions"] = serde_json::json!(d);
        }

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp: EmbeddingResponse = rb
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExternalCallError::from_http(COLLABORATOR, &e))?
            .json()
            .await
            .map_err(|e| ExternalCallError::from_http(COLLABORATOR, &e))?;

        let mut data = resp.data;
        if data.len() != expected {
            return Err(ExternalCallError::fatal(
                COLLABORATOR,
                format!("expected {expected} embeddings, got {}", data.len()),
            ));
        }
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }
}
