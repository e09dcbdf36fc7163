//! OpenAI Chat Completions API driver.
//!
//! Implements [`ChatModel`] for `/v1/chat/completions` with `stream: true`,
//! yielding the assistant's content deltas as tokens.

use futures::StreamExt;

use crate::error::ExternalCallError;

use super::{ChatModel, ChatRequest, LlmSettings, TokenStream};

const COLLABORATOR: &str = "chat";

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn body(&self, req: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": req.model.as_deref().unwrap_or(&self.settings.model),
            "stream": true,
            "messages": req.messages,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatModel for ChatCompletionsDriver {
    async fn stream_chat(&self, req: ChatRequest) -> Result<TokenStream, ExternalCallError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let mut rb = self.http.post(&url).json(&self.body(&req));
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExternalCallError::from_http(COLLABORATOR, &e))?;
        let byte_stream = resp.bytes_stream();

        tracing::debug!(url = %url, message_count = req.messages.len(), "Chat stream opened");

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| ExternalCallError::from_http(COLLABORATOR, &e))?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = find_double_newline(&buf) {
                    let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                    let text = String::from_utf8_lossy(&frame);

                    for data in sse_data_lines(&text) {
                        if data == "[DONE]" {
                            return;
                        }
                        if let Some(token) = parse_content_delta(data)? {
                            yield token;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn sse_data_lines(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

/// Extract the assistant text delta from one `data:` payload.
fn parse_content_delta(data: &str) -> Result<Option<String>, ExternalCallError> {
    let v: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ExternalCallError::fatal(COLLABORATOR, format!("malformed chunk: {e}")))?;
    if let Some(err) = v.get("error") {
        return Err(ExternalCallError::fatal(COLLABORATOR, err.to_string()));
    }
    Ok(v["choices"][0]["delta"]
        .get("content")
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string))
}
