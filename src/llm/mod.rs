//! Model collaborators used during ingestion and chain execution.
//!
//! The core never hosts models. It talks to them through two traits:
//!
//! - [`ChatModel`]: streams answer tokens for a conversation
//! - [`embeddings::Embedder`]: turns texts into vectors
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: `OpenAI` Chat Completions API (`/v1/chat/completions`)
//! - [`embeddings::FastEmbedder`]: local `fastembed` model
//! - [`embeddings::OpenAiEmbedder`]: `OpenAI` Embeddings API (`/v1/embeddings`)

pub mod chat_completions;
pub mod embeddings;

pub use chat_completions::ChatCompletionsDriver;
pub use embeddings::Embedder;

use crate::error::ExternalCallError;
use futures::Stream;
use std::pin::Pin;

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o-mini`).
    pub model: String,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Request to a chat model.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Overrides the driver's configured model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

/// Stream of answer tokens. Dropping it releases the underlying connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ExternalCallError>> + Send>>;

/// Trait for streaming chat models.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync + std::fmt::Debug {
    /// Start streaming a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or is rejected.
    async fn stream_chat(&self, request: ChatRequest) -> Result<TokenStream, ExternalCallError>;
}
