//! Model provider seam (spec §6 "ModelProvider (consumed)").
//!
//! The kernel depends only on the [`ModelProvider`] trait: given an assembled
//! context and tool manifest, produce a stream of chunks plus a terminal usage
//! record. `OpenAiCompatibleProvider` is the one bundled implementation,
//! built on the same HTTP/SSE plumbing `client.rs`'s `query`/`Client::send`
//! use (`reqwest` streaming, `utils::parse_sse_stream`,
//! `utils::ToolCallAggregator`) but stateless — it takes history in, returns
//! chunks out, and keeps no conversation of its own.

use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::tools::Tool;
use crate::types::{ContentBlock, Message, MessageRole, OpenAIContent, OpenAIMessage, OpenAIRequest};
use crate::utils::{ToolCallAggregator, parse_sse_stream};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// Everything a provider needs to produce the next assistant turn.
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

/// Token accounting for a completed turn, when the provider reports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One piece of a streamed model response.
#[derive(Debug, Clone)]
pub enum ModelChunk {
    /// A completed content block (text, reasoning, or a full tool call).
    Block(ContentBlock),
    /// Stream finished; `usage` is `None` when the provider doesn't report it.
    Done { usage: Option<ModelUsage> },
}

pub type ModelChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

/// The kernel's sole seam onto a language model. Implementations own their
/// own transport, auth, and retry/backoff policy.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn stream_complete(&self, ctx: ModelContext) -> Result<ModelChunkStream>;
}

/// Bundled `ModelProvider` for OpenAI-compatible chat-completions endpoints
/// (LM Studio, Ollama, llama.cpp, vLLM, OpenAI itself). Stateless: each call
/// builds its own request from the supplied `ModelContext`.
pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_timeout(base_url, api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, ctx: &ModelContext) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(ctx.messages.len() + 1);

        if !ctx.system_prompt.is_empty() {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(OpenAIContent::Text(ctx.system_prompt.clone())),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &ctx.messages {
            let text = msg
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(t) => Some(t.text.clone()),
                    ContentBlock::ToolResult(r) => Some(r.content.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");

            let tool_call_id = msg.content.iter().find_map(|block| match block {
                ContentBlock::ToolResult(r) => Some(r.tool_use_id.clone()),
                _ => None,
            });

            messages.push(OpenAIMessage {
                role: match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                }
                .to_string(),
                content: Some(OpenAIContent::Text(text)),
                tool_calls: None,
                tool_call_id,
            });
        }

        let tools = if ctx.tools.is_empty() {
            None
        } else {
            Some(ctx.tools.iter().map(|t| t.to_openai_format()).collect())
        };

        OpenAIRequest {
            model: ctx.model.clone(),
            messages,
            stream: true,
            max_tokens: ctx.max_tokens,
            temperature: Some(ctx.temperature),
            tools,
        }
    }

    async fn send_once(&self, request: &OpenAIRequest) -> Result<ModelChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Error::api(format!("API error {status}: {body}")));
        }

        let sse = parse_sse_stream(response);
        let stream = sse.scan(ToolCallAggregator::new(), |aggregator, chunk_result| {
            let out = match chunk_result {
                Ok(chunk) => match aggregator.process_chunk(chunk) {
                    Ok(blocks) if blocks.is_empty() => vec![],
                    Ok(blocks) => blocks
                        .into_iter()
                        .map(|b| Ok(ModelChunk::Block(b)))
                        .chain(std::iter::once(Ok(ModelChunk::Done { usage: None })))
                        .collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(futures::stream::iter(out)))
        });

        Ok(Box::pin(stream.flatten()))
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn stream_complete(&self, ctx: ModelContext) -> Result<ModelChunkStream> {
        let request = self.build_request(&ctx);

        // The stream itself isn't retried (we'd double-emit partial content);
        // only the connection attempt is, mirroring the teacher's
        // `retry_with_backoff_conditional` use for transient provider failures.
        retry_with_backoff_conditional(self.retry.clone(), || self.send_once(&request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextBlock;

    #[test]
    fn build_request_includes_system_and_history() {
        let provider = OpenAiCompatibleProvider::new("http://localhost:1234/v1", "not-needed");
        let ctx = ModelContext {
            system_prompt: "be terse".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            model: "qwen2.5".into(),
            max_tokens: Some(128),
            temperature: 0.2,
        };
        let request = provider.build_request(&ctx);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1].role, "user");
        assert_eq!(request.model, "qwen2.5");
    }

    #[test]
    fn build_request_omits_system_when_empty() {
        let provider = OpenAiCompatibleProvider::new("http://localhost:1234/v1", "not-needed");
        let ctx = ModelContext {
            system_prompt: String::new(),
            messages: vec![Message::assistant(vec![ContentBlock::Text(TextBlock::new(
                "ok",
            ))])],
            tools: vec![],
            model: "m".into(),
            max_tokens: None,
            temperature: 1.0,
        };
        let request = provider.build_request(&ctx);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, "assistant");
    }
}
