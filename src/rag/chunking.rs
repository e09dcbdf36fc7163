//! Document chunking strategies.
//!
//! Chunking is a pure function of `(text, strategy)`: the same input always
//! yields the same ordered list of chunks.

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use serde::{Deserialize, Serialize};
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use thiserror::Error;
use tracing::debug;

/// Blank-line boundary used when a regex strategy names no patterns.
pub const DEFAULT_SPLIT_PATTERN: &str = r"\n\s*\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Split on patterns, then enforce a maximum size in characters
    Regex {
        #[serde(default = "ChunkingStrategy::default_patterns")]
        patterns: Vec<String>,
        max_chunk_size: usize,
    },
    /// Paragraph-level text nodes of a markdown document
    Markdown,
    /// Groups of exactly `chunk_size` words (last group may be shorter)
    FixedWords { chunk_size: usize },
    /// Character windows of `window_size` advancing by `step`
    SlidingWindow { window_size: usize, step: usize },
    /// Recursive character splitting trying to respect semantic boundaries (paragraphs, etc.)
    Recursive { size: usize },
    /// Split by sentence
    Sentence,
    /// Keep full document (no chunking)
    Document,
}

impl ChunkingStrategy {
    pub fn default_patterns() -> Vec<String> {
        vec![DEFAULT_SPLIT_PATTERN.to_string()]
    }

    /// Regex strategy with the blank-line pattern.
    pub fn regex(max_chunk_size: usize) -> Self {
        Self::Regex {
            patterns: Self::default_patterns(),
            max_chunk_size,
        }
    }
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::regex(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunking parameter `{parameter}`: {reason}")]
    InvalidParameter { parameter: String, reason: String },
    #[error("invalid split pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl ChunkError {
    fn zero(parameter: &str) -> Self {
        Self::InvalidParameter {
            parameter: parameter.to_string(),
            reason: "must be greater than zero".to_string(),
        }
    }
}

/// Splits raw text into retrievable units using one strategy.
///
/// Regex patterns are compiled once in [`Chunker::new`].
#[derive(Debug, Clone)]
pub struct Chunker {
    strategy: ChunkingStrategy,
    patterns: Vec<Regex>,
}

impl Chunker {
    pub fn new(strategy: ChunkingStrategy) -> Result<Self, ChunkError> {
        let mut patterns = Vec::new();
        match &strategy {
            ChunkingStrategy::Regex {
                patterns: sources,
                max_chunk_size,
            } => {
                if *max_chunk_size == 0 {
                    return Err(ChunkError::zero("max_chunk_size"));
                }
                let sources = if sources.is_empty() {
                    ChunkingStrategy::default_patterns()
                } else {
                    sources.clone()
                };
                for source in sources {
                    let re = Regex::new(&source).map_err(|e| ChunkError::InvalidPattern {
                        pattern: source.clone(),
                        reason: e.to_string(),
                    })?;
                    patterns.push(re);
                }
            }
            ChunkingStrategy::FixedWords { chunk_size: 0 } => {
                return Err(ChunkError::zero("chunk_size"));
            }
            ChunkingStrategy::SlidingWindow { window_size, step } => {
                if *window_size == 0 {
                    return Err(ChunkError::zero("window_size"));
                }
                if *step == 0 {
                    return Err(ChunkError::zero("step"));
                }
            }
            ChunkingStrategy::Recursive { size: 0 } => return Err(ChunkError::zero("size")),
            _ => {}
        }
        Ok(Self { strategy, patterns })
    }

    pub fn strategy(&self) -> &ChunkingStrategy {
        &self.strategy
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chunks = match &self.strategy {
            ChunkingStrategy::Regex { max_chunk_size, .. } => {
                regex_chunks(text, &self.patterns, *max_chunk_size)
            }
            ChunkingStrategy::Markdown => markdown_chunks(text),
            ChunkingStrategy::FixedWords { chunk_size } => fixed_word_chunks(text, *chunk_size),
            ChunkingStrategy::SlidingWindow { window_size, step } => {
                sliding_window_chunks(text, *window_size, *step)
            }
            ChunkingStrategy::Recursive { size } => {
                let config = ChunkConfig::new(*size)
                    .with_sizer(Characters)
                    .with_trim(true);
                let splitter = TextSplitter::new(config);
                splitter.chunks(text).map(|s: &str| s.to_string()).collect()
            }
            ChunkingStrategy::Sentence => text
                .split_inclusive(&['.', '!', '?'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            ChunkingStrategy::Document => {
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![text.to_string()]
                }
            }
        };
        debug!(strategy = ?self.strategy, chunk_count = chunks.len(), "Chunked text");
        chunks
    }
}

fn regex_chunks(text: &str, patterns: &[Regex], max_chunk_size: usize) -> Vec<String> {
    let mut fragments = vec![text];
    for re in patterns {
        fragments = fragments.into_iter().flat_map(|f| re.split(f)).collect();
    }

    let mut chunks = Vec::new();
    for fragment in fragments {
        split_oversized(fragment.trim(), max_chunk_size, &mut chunks);
    }
    chunks
}

/// Re-split `fragment` so no piece exceeds `max` chars.
///
/// Breaks at the last whitespace in the back half of the window; without one,
/// cuts at exactly `max` chars.
fn split_oversized(fragment: &str, max: usize, out: &mut Vec<String>) {
    let mut rest = fragment;
    while rest.chars().count() > max {
        // rest has more than `max` chars, so index `max` exists
        let window: Vec<(usize, char)> = rest.char_indices().take(max + 1).collect();
        let floor = (max / 2).max(1);
        let cut = (floor..=max)
            .rev()
            .find(|&i| window[i].1.is_whitespace())
            .unwrap_or(max);
        let byte_cut = window[cut].0;

        let piece = rest[..byte_cut].trim_end();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = rest[byte_cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
}

fn markdown_chunks(text: &str) -> Vec<String> {
    // Open capturing blocks. A nested block flushes its parent first so
    // chunks come out in document order.
    let mut stack: Vec<String> = Vec::new();
    let mut chunks = Vec::new();

    let flush = |buf: &mut String, chunks: &mut Vec<String>| {
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        buf.clear();
    };

    for event in Parser::new(text) {
        match event {
            Event::Start(Tag::Paragraph | Tag::Heading { .. } | Tag::Item) => {
                if let Some(parent) = stack.last_mut() {
                    flush(parent, &mut chunks);
                }
                stack.push(String::new());
            }
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => {
                if let Some(mut buf) = stack.pop() {
                    flush(&mut buf, &mut chunks);
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some(buf) = stack.last_mut() {
                    buf.push_str(&t);
                }
            }
            Event::SoftBreak => {
                if let Some(buf) = stack.last_mut() {
                    buf.push(' ');
                }
            }
            Event::HardBreak => {
                if let Some(buf) = stack.last_mut() {
                    buf.push('\n');
                }
            }
            _ => {}
        }
    }
    chunks
}

fn fixed_word_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words.chunks(chunk_size).map(|w| w.join(" ")).collect()
}

fn sliding_window_chunks(text: &str, window_size: usize, step: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + window_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
