use serde::{Deserialize, Serialize};
use tracing::info;

use super::token_service::TokenService;
use crate::llm::{Message, MessageRole};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStrategy {
    /// Keep only the most recent messages that fit within the token budget.
    #[default]
    SlidingWindow,
    /// Keep first (System+First User) and last N messages, truncate middle.
    KeepFirstLast,
    /// Never trim.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub strategy: HistoryStrategy,
    /// Maximum tokens allowed for the conversation history.
    pub max_tokens: usize,
    /// Trim once usage exceeds this share of `max_tokens` (0.0 - 1.0).
    pub trigger_threshold: f32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            strategy: HistoryStrategy::SlidingWindow,
            max_tokens: 3000,
            trigger_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryAction {
    pub strategy: HistoryStrategy,
    pub messages_removed: usize,
    pub tokens_saved: usize,
}

/// Keeps conversation history inside a token budget.
#[derive(Debug, Clone)]
pub struct HistoryManager {
    config: HistoryConfig,
    tokens: TokenService,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig, tokens: TokenService) -> Self {
        Self { config, tokens }
    }

    /// Apply the configured strategy if usage crosses the trigger threshold.
    ///
    /// Returns the (potentially trimmed) messages and a report if anything was removed.
    pub fn apply(&self, messages: Vec<Message>) -> (Vec<Message>, Option<HistoryAction>) {
        let current_tokens = self.tokens.count_messages(&messages);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let threshold = (self.config.max_tokens as f32 * self.config.trigger_threshold) as usize;

        if current_tokens <= threshold {
            return (messages, None);
        }

        info!(
            current_tokens,
            threshold,
            strategy = ?self.config.strategy,
            "History over budget, trimming"
        );

        let original_len = messages.len();
        let trimmed = match self.config.strategy {
            HistoryStrategy::SlidingWindow => self.sliding_window(&messages),
            HistoryStrategy::KeepFirstLast => self.keep_first_last(&messages),
            HistoryStrategy::None => return (messages, None),
        };

        let tokens_saved = current_tokens.saturating_sub(self.tokens.count_messages(&trimmed));
        let action = HistoryAction {
            strategy: self.config.strategy,
            messages_removed: original_len - trimmed.len(),
            tokens_saved,
        };
        (trimmed, Some(action))
    }

    /// Budget left for message bodies after reply priming.
    fn budget(&self) -> usize {
        self.config.max_tokens.saturating_sub(3)
    }

    fn sliding_window(&self, messages: &[Message]) -> Vec<Message> {
        let mut budget = self.budget();
        let mut final_list = Vec::new();

        // 1. Preserve System Prompt
        if let Some(sys) = messages.iter().find(|m| m.role == MessageRole::System) {
            budget = budget.saturating_sub(self.tokens.count_message(sys));
            final_list.push(sys.clone());
        }

        // 2. Keep recent messages within remaining budget
        let mut tail = Vec::new();
        for msg in messages.iter().rev().filter(|m| m.role != MessageRole::System) {
            let t = self.tokens.count_message(msg);
            if t > budget {
                break;
            }
            tail.push(msg.clone());
            budget -= t;
        }
        tail.reverse();
        final_list.extend(tail);
        final_list
    }

    fn keep_first_last(&self, messages: &[Message]) -> Vec<Message> {
        let mut budget = self.budget();
        let mut head = Vec::new();
        let mut head_len = 0;

        // System messages, then the first non-system message.
        for msg in messages {
            head_len += 1;
            let t = self.tokens.count_message(msg);
            if t <= budget {
                head.push(msg.clone());
                budget -= t;
            }
            if msg.role != MessageRole::System {
                break;
            }
        }

        // Fill from the end, never reaching back into the head.
        let mut tail = Vec::new();
        for msg in messages[head_len..].iter().rev() {
            let t = self.tokens.count_message(msg);
            if t > budget {
                break;
            }
            tail.push(msg.clone());
            budget -= t;
        }
        tail.reverse();

        head.extend(tail);
        head
    }
}
