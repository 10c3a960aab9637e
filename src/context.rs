//! Context management utilities for manual history management
//!
//! This module provides low-level helpers for managing conversation history.
//! These are opt-in utilities - nothing is automatic. You decide when and how
//! to manage context.
//!
//! # Features
//!
//! - Token estimation (character-based approximation)
//! - Message truncation with system prompt preservation
//! - Manual history management patterns
//!
//! # Examples
//!
//! ```rust
//! use agent_kernel::{estimate_tokens, truncate_messages};
//!
//! // Estimate tokens
//! let messages = vec![/* your messages */];
//! let tokens = estimate_tokens(&messages);
//! println!("Estimated tokens: {}", tokens);
//!
//! // Truncate when needed
//! if tokens > 28000 {
//!     let truncated = truncate_messages(&messages, 10, true);
//!     // Use truncated messages...
//! }
//! ```

use crate::types::Message;

/// Estimate token count for message list
///
/// Uses character-based approximation (1 token ≈ 4 characters).
///
/// # Arguments
///
/// * `messages` - List of messages to estimate tokens for
///
/// # Returns
///
/// Estimated token count
///
/// # Note
///
/// This is an APPROXIMATION. Actual token counts vary by model family:
/// - GPT models: ~70-85% accurate (different tokenizers)
/// - Llama, Qwen, Mistral: ~70-85% accurate
/// - Always include 10-20% safety margin when checking limits
///
/// For more accurate estimation, consider using tiktoken bindings
/// (not included to keep dependencies minimal).
///
/// # Examples
///
/// ```rust
/// use agent_kernel::{Message, MessageRole, estimate_tokens};
///
/// let messages = vec![
///     Message::system("You are a helpful assistant"),
///     Message::user("Hello!"),
/// ];
///
/// let tokens = estimate_tokens(&messages);
/// println!("Estimated tokens: {}", tokens);
///
/// // Check if approaching context limit
/// if tokens > 28000 {
///     println!("Need to truncate!");
/// }
/// ```
pub fn estimate_tokens(messages: &[Message]) -> usize {
    // Character-based approximation: 1 token ≈ 4 characters
    // This is a conservative estimate that works across model families

    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        // Count role overhead (approximately 1-2 tokens)
        total_chars += 8; // ~2 tokens for role formatting

        // Count content
        for block in &message.content {
            match block {
                crate::types::ContentBlock::Text(text) => {
                    total_chars += text.text.len();
                }
                crate::types::ContentBlock::ToolUse(tool) => {
                    // Tool calls add significant overhead
                    total_chars += tool.name.len();
                    total_chars += tool.id.len();
                    total_chars += tool.input.to_string().len();
                }
                crate::types::ContentBlock::ToolResult(result) => {
                    // Tool results add overhead
                    total_chars += result.tool_use_id.len();
                    total_chars += result.content.to_string().len();
                }
            }
        }
    }

    // Add conversation-level overhead (~2-4 tokens)
    total_chars += 16;

    // Convert characters to tokens (4 chars ≈ 1 token, round up for safety)
    (total_chars + 3) / 4 // Ceiling division
}

/// Truncate message history, keeping recent messages
///
/// Always preserves the system prompt (if present) and keeps the most
/// recent N messages. This is a simple truncation - it does NOT attempt
/// to preserve tool chains or important context.
///
/// # Arguments
///
/// * `messages` - List of messages to truncate
/// * `keep` - Number of recent messages to keep (default: 10)
/// * `preserve_system` - Keep system message if present (default: true)
///
/// # Returns
///
/// Truncated message list (new Vec, original unchanged)
///
/// # Examples
///
/// ```rust
/// use agent_kernel::{Message, Client, truncate_messages, estimate_tokens};
///
/// # async fn example(mut client: Client) {
/// // Manual truncation when needed
/// let tokens = estimate_tokens(client.history());
/// if tokens > 28000 {
///     let truncated = truncate_messages(client.history(), 10, true);
///     *client.history_mut() = truncated;
/// }
/// # }
/// ```
///
/// # Note
///
/// This is a SIMPLE truncation. For domain-specific needs (e.g.,
/// preserving tool call chains, keeping important context), implement
/// your own logic or use this as a starting point.
///
/// Warning: Truncating mid-conversation may remove context that the
/// model needs to properly respond. Use judiciously at natural breakpoints.
pub fn truncate_messages(messages: &[Message], keep: usize, preserve_system: bool) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    if messages.len() <= keep {
        return messages.to_vec();
    }

    // Check if first message is system prompt
    let has_system = preserve_system
        && !messages.is_empty()
        && messages[0].role == crate::types::MessageRole::System;

    if has_system {
        // Keep system + last N messages
        let mut result = vec![messages[0].clone()];
        if keep > 0 && messages.len() > 1 {
            let start = messages.len().saturating_sub(keep);
            result.extend_from_slice(&messages[start..]);
        }
        result
    } else {
        // Just keep last N messages
        if keep > 0 {
            let start = messages.len().saturating_sub(keep);
            messages[start..].to_vec()
        } else {
            Vec::new()
        }
    }
}

/// Check if history is approaching a token limit
///
/// Convenience function that combines estimation with a threshold check.
///
/// # Arguments
///
/// * `messages` - Messages to check
/// * `limit` - Token limit (e.g., 32000 for a 32k context window)
/// * `margin` - Safety margin as a percentage (default: 0.9 = 90%)
///
/// # Returns
///
/// `true` if estimated tokens exceed limit * margin
///
/// # Examples
///
/// ```rust
/// use agent_kernel::{is_approaching_limit, Message};
///
/// # fn example(messages: Vec<Message>) {
/// if is_approaching_limit(&messages, 32000, 0.9) {
///     println!("Time to truncate!");
/// }
/// # }
/// ```
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

// ============================================================================
// ContextManager — automatic assembly and compression (spec §4.7)
// ============================================================================

use crate::types::ContentBlock;
use std::sync::Arc;

/// How reasoning blocks are carried back to the model on the next turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningTransport {
    /// Hand reasoning back to the provider verbatim (providers that support it).
    Provider,
    /// Fold reasoning into an ordinary text block.
    Text,
    /// Drop reasoning blocks before the next turn.
    Omit,
}

/// Configuration for one agent's `ContextManager`.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub compress_to_tokens: usize,
    pub keep_recent_multimodal: usize,
    pub reasoning_transport: ReasoningTransport,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 32_000,
            compress_to_tokens: 16_000,
            keep_recent_multimodal: 4,
            reasoning_transport: ReasoningTransport::Text,
        }
    }
}

/// Produces a summary message in place of the compressed-away history.
/// Defaults to a deterministic truncation; callers may plug in a model-backed
/// summarizer without changing `ContextManager`'s call sites.
pub type Summarizer = Arc<dyn Fn(&[Message]) -> String + Send + Sync>;

fn default_summarizer(messages: &[Message]) -> String {
    format!("[{} earlier messages omitted to stay within the context window]", messages.len())
}

/// Assembles the message window sent to the model each turn and compresses it
/// when it grows past `max_tokens`. A thin stateful wrapper around the
/// free-function primitives above — `estimate_tokens`/`truncate_messages`
/// already do the arithmetic; this adds the emit-on-compress and multimodal
/// retention policy spec §4.7 asks for.
pub struct ContextManager {
    config: ContextConfig,
    summarizer: Summarizer,
}

/// Events a `ContextManager` surfaces so they can be published to the
/// `monitor` channel without the manager depending on `EventBus` directly.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    CompressionStarted { before_tokens: usize },
    CompressionFinished { after_tokens: usize, ratio: f32, summary: String },
    ToolManualUpdated { hash: String },
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config, summarizer: Arc::new(default_summarizer) }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Returns `messages` unchanged if under budget, or a compressed
    /// replacement plus the events that fired along the way.
    pub fn assemble(&self, messages: &[Message]) -> (Vec<Message>, Vec<ContextEvent>) {
        let mut events = Vec::new();
        let retained = self.apply_multimodal_retention(messages);
        let before_tokens = estimate_tokens(&retained);

        if before_tokens <= self.config.max_tokens {
            return (retained, events);
        }

        events.push(ContextEvent::CompressionStarted { before_tokens });

        let has_system = retained.first().is_some_and(|m| m.role == crate::types::MessageRole::System);
        let mut keep = retained.len().saturating_sub(1).max(1);
        let mut candidate = truncate_messages(&retained, keep, has_system);
        while estimate_tokens(&candidate) > self.config.compress_to_tokens && keep > 1 {
            keep -= 1;
            candidate = truncate_messages(&retained, keep, has_system);
        }

        let dropped_count = retained.len().saturating_sub(candidate.len());
        let compressed = if dropped_count > 0 {
            let dropped = &retained[..retained.len() - candidate.len()];
            let summary = (self.summarizer)(dropped);
            let mut out = Vec::with_capacity(candidate.len() + 1);
            let insert_at = if has_system { 1.min(candidate.len()) } else { 0 };
            out.extend_from_slice(&candidate[..insert_at]);
            out.push(Message::system(summary.clone()));
            out.extend_from_slice(&candidate[insert_at..]);

            let after_tokens = estimate_tokens(&out);
            events.push(ContextEvent::CompressionFinished {
                after_tokens,
                ratio: after_tokens as f32 / before_tokens.max(1) as f32,
                summary,
            });
            out
        } else {
            candidate
        };

        (compressed, events)
    }

    /// Keeps the most recent `keep_recent_multimodal` messages' image/audio/file
    /// blocks intact; older ones are replaced with a text placeholder, on the
    /// theory that old media rarely needs to stay in the live window verbatim.
    fn apply_multimodal_retention(&self, messages: &[Message]) -> Vec<Message> {
        let keep_recent = self.config.keep_recent_multimodal;
        if messages.len() <= keep_recent {
            return messages.to_vec();
        }
        let cutoff = messages.len() - keep_recent;
        messages
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                if i >= cutoff {
                    return msg.clone();
                }
                let has_media = msg
                    .content
                    .iter()
                    .any(|b| matches!(b, ContentBlock::Image(_) | ContentBlock::Audio(_) | ContentBlock::File(_)));
                if !has_media {
                    return msg.clone();
                }
                let content = msg
                    .content
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Image(_) | ContentBlock::Audio(_) | ContentBlock::File(_) => {
                            ContentBlock::Text(crate::types::TextBlock::new("[older media retained out-of-band]"))
                        }
                        other => other.clone(),
                    })
                    .collect();
                Message::new(msg.role.clone(), content)
            })
            .collect()
    }

    /// Applies `reasoning_transport` to one assistant message before it joins
    /// durable history.
    pub fn transform_reasoning(&self, message: Message) -> Message {
        match self.config.reasoning_transport {
            ReasoningTransport::Provider => message,
            ReasoningTransport::Text => {
                let content = message
                    .content
                    .into_iter()
                    .map(|b| match b {
                        ContentBlock::Reasoning(r) => ContentBlock::Text(crate::types::TextBlock::new(r.text)),
                        other => other,
                    })
                    .collect();
                Message::new(message.role, content)
            }
            ReasoningTransport::Omit => {
                let content = message
                    .content
                    .into_iter()
                    .filter(|b| !matches!(b, ContentBlock::Reasoning(_)))
                    .collect();
                Message::new(message.role, content)
            }
        }
    }
}

#[cfg(test)]
mod context_manager_tests {
    use super::*;
    use crate::types::{ReasoningBlock, TextBlock};

    #[test]
    fn assemble_passes_through_when_under_budget() {
        let manager = ContextManager::new(ContextConfig::default());
        let messages = vec![Message::user("hi")];
        let (out, events) = manager.assemble(&messages);
        assert_eq!(out.len(), 1);
        assert!(events.is_empty());
    }

    #[test]
    fn assemble_compresses_when_over_budget() {
        let messages: Vec<Message> = (0..50)
            .map(|i| Message::user("x".repeat(2000) + &i.to_string()))
            .collect();
        let manager = ContextManager::new(ContextConfig {
            max_tokens: 500,
            compress_to_tokens: 200,
            ..ContextConfig::default()
        });
        let (out, events) = manager.assemble(&messages);
        assert!(out.len() < messages.len());
        assert!(events.iter().any(|e| matches!(e, ContextEvent::CompressionStarted { .. })));
        assert!(events.iter().any(|e| matches!(e, ContextEvent::CompressionFinished { .. })));
    }

    #[test]
    fn transform_reasoning_text_mode_folds_into_text() {
        let manager = ContextManager::new(ContextConfig::default());
        let msg = Message::assistant(vec![ContentBlock::Reasoning(ReasoningBlock::new("thinking..."))]);
        let transformed = manager.transform_reasoning(msg);
        assert!(matches!(transformed.content[0], ContentBlock::Text(_)));
    }

    #[test]
    fn transform_reasoning_omit_mode_drops_block() {
        let mut config = ContextConfig::default();
        config.reasoning_transport = ReasoningTransport::Omit;
        let manager = ContextManager::new(config);
        let msg = Message::assistant(vec![
            ContentBlock::Reasoning(ReasoningBlock::new("thinking...")),
            ContentBlock::Text(TextBlock::new("answer")),
        ]);
        let transformed = manager.transform_reasoning(msg);
        assert_eq!(transformed.content.len(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, Message, MessageRole, TextBlock};

    #[test]
    fn test_estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::new(
            MessageRole::User,
            vec![ContentBlock::Text(TextBlock::new("Hello world"))],
        )];

        let tokens = estimate_tokens(&messages);
        // "Hello world" = 11 chars + overhead ≈ 5-8 tokens
        assert!(tokens >= 3 && tokens <= 10);
    }

    #[test]
    fn test_truncate_messages_empty() {
        let messages: Vec<Message> = vec![];
        let truncated = truncate_messages(&messages, 10, true);
        assert_eq!(truncated.len(), 0);
    }

    #[test]
    fn test_truncate_messages_preserve_system() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
            Message::user("Message 4"),
        ];

        let truncated = truncate_messages(&messages, 2, true);

        // Should have system + last 2 = 3 messages
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].role, MessageRole::System);
    }

    #[test]
    fn test_truncate_messages_no_preserve() {
        let messages = vec![
            Message::system("System prompt"),
            Message::user("Message 1"),
            Message::user("Message 2"),
            Message::user("Message 3"),
        ];

        let truncated = truncate_messages(&messages, 2, false);

        // Should have only last 2 messages
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].role, MessageRole::User);
    }

    #[test]
    fn test_truncate_messages_keep_all() {
        let messages = vec![Message::user("Message 1"), Message::user("Message 2")];

        let truncated = truncate_messages(&messages, 10, true);
        assert_eq!(truncated.len(), 2);
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("x".repeat(1000))];

        // ~250 tokens, should not exceed 90% of 1000
        assert!(!is_approaching_limit(&messages, 1000, 0.9));

        // Should exceed 90% of 200
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
