use std::sync::Arc;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::llm::Message;

/// Token counting with the cl100k_base encoding (GPT-4/3.5 standard).
///
/// Falls back to a four-characters-per-token estimate if the encoding
/// cannot be loaded. Cloning is cheap.
#[derive(Clone)]
pub struct TokenService {
    bpe: Option<Arc<CoreBPE>>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("encoding", &if self.bpe.is_some() { "cl100k_base" } else { "estimate" })
            .finish()
    }
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenService {
    pub fn new() -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k_base unavailable, estimating tokens from length");
                None
            }
        };
        Self { bpe }
    }

    /// Length-based estimate only.
    pub fn estimating() -> Self {
        Self { bpe: None }
    }

    /// Count tokens in a string.
    pub fn count(&self, content: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(content).len(),
            None => content.chars().count().div_ceil(4),
        }
    }

    /// Tokens for one chat message, including per-message framing.
    pub fn count_message(&self, message: &Message) -> usize {
        // <|start|>{role}\n{content}<|end|>\n
        self.count(&message.content) + 3
    }

    /// Tokens for a conversation, including reply priming.
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum::<usize>() + 3
    }
}
