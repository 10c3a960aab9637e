//! # agent-kernel
//!
//! A crash-safe agent runtime kernel: an embeddable core, analogous to a
//! database storage engine, that drives long-lived conversations between a
//! user and an LLM, dispatches model-requested tool calls concurrently, and
//! survives process restarts by journaling every state transition.
//!
//! ## Overview
//!
//! `agent-kernel` is not a chat client. It is the hard core a chat client,
//! CLI, or server wraps with its own I/O, auth, and UI:
//! - an eight-state breakpoint machine per agent ([`agent_loop`]) that
//!   resumes deterministically after a crash
//! - bounded-concurrency tool dispatch with permission gating and approval
//!   suspension ([`dispatcher`], [`permission`])
//! - a totally-ordered, three-channel event bus with bookmarked replay
//!   ([`events`])
//! - a write-ahead persistence protocol over messages, tool records, and
//!   agent metadata ([`store`]), with snapshot/fork semantics
//! - a bounded pool of coexisting agents and a mention-routed room
//!   ([`pool`], [`room`])
//!
//! Concrete LLM transports, built-in tool implementations, and storage
//! backends beyond the abstract [`store::Store`] trait are the embedder's
//! responsibility; the kernel ships one reference adapter of each
//! ([`provider::OpenAiCompatibleProvider`], [`store::FileStore`]) to prove
//! the interfaces out, not as the point of the crate.
//!
//! ## Key Features
//!
//! - **Crash safety**: every breakpoint transition and tool-call state
//!   change is journaled before it's acted on; a killed process resumes
//!   with no un-accounted-for tool call (auto-seal, see [`agent_loop`])
//! - **Concurrent tool dispatch**: fan-out bounded by a semaphore, with
//!   mutating calls serialized and results reordered back to call order
//! - **Permission gating**: allow/deny/ask policy per tool, with
//!   suspend-and-resume approval flow
//! - **Three-channel events**: `progress` (user-facing streaming),
//!   `control` (approval decisions), `monitor` (governance/observability),
//!   each independently replayable from a bookmark
//! - **Snapshot & fork**: capture an agent at a Safe-Fork-Point and branch
//!   a new agent from it, with full lineage tracking
//!
//! ## Example
//!
//! ```rust,no_run
//! use agent_kernel::{AgentId, AgentOptions, EventBus, InMemoryStore};
//! use agent_kernel::agent_loop::{AgentLoop, QueuedMessage};
//! use agent_kernel::provider::OpenAiCompatibleProvider;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .system_prompt("You are a helpful assistant")
//!         .model("qwen2.5-32b-instruct")
//!         .base_url("http://localhost:1234/v1")
//!         .build()?;
//!
//!     let store = Arc::new(InMemoryStore::new());
//!     let events = Arc::new(EventBus::new(store.clone()));
//!     let provider = Arc::new(OpenAiCompatibleProvider::new(options.base_url().to_string(), ""));
//!     let agent = AgentLoop::new(AgentId::generate(), store, events, provider, options);
//!
//!     agent.enqueue(QueuedMessage::User("What's the capital of France?".into()));
//!     while agent.step().await? {}
//!
//!     for message in agent.history().await {
//!         println!("{:?}", message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The kernel is organized so each module matches one component of the
//! design (see `DESIGN.md` in the repository root for the full grounding
//! ledger):
//!
//! - **agent_loop**: the per-agent breakpoint state machine
//! - **dispatcher**: concurrent tool-call execution with permission/hook gating
//! - **permission**: allow/deny/ask policy and pending-approval bookkeeping
//! - **hook_manager**: lifecycle hook points and their verdict sum-types
//! - **events**: the three-channel event bus with bookmarked replay
//! - **store**: the persistence protocol plus `FileStore`/`InMemoryStore`
//! - **model**: the persisted data model (breakpoints, tool records, snapshots)
//! - **context**: prompt assembly, compression, and multimodal retention
//! - **todo**, **scheduler**, **watcher**: reminder-injecting subsystems
//! - **pool**, **room**: multi-agent lifecycle and mention-based routing
//! - **tools**, **types**, **provider**, **sandbox**: the tool/message/model
//!   data model and the external-collaborator traits
//! - **client**: the original single-provider streaming client, kept as the
//!   low-level request/response primitive `AgentLoop` builds on
//! - **config**, **error**, **context**, **retry**, **utils**: the ambient
//!   stack (configuration layering, error taxonomy, token estimation,
//!   retry-with-backoff, SSE parsing)

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================
// These modules are private (internal implementation details) unless explicitly
// re-exported through `pub use` statements below.

/// Core client implementation providing streaming queries and stateful conversations.
/// Contains the `query()` function for single-turn queries and `Client` struct
/// for multi-turn conversations with automatic state management.
mod client;

/// Provider configuration helpers for LM Studio, Ollama, llama.cpp, and vLLM.
/// Simplifies endpoint and model name resolution with environment variable support.
mod config;

/// Context window management utilities for token estimation and history truncation.
/// Provides manual control over conversation memory to prevent context overflow.
mod context;

/// Error types and conversions for comprehensive error handling throughout the SDK.
/// Defines the `Error` enum and `Result<T>` type alias used across all public APIs.
mod error;

/// The three-channel event bus: publish, persist, and replay-then-live subscribe.
pub mod events;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
/// Enables security gates, audit logging, input/output modification, and compliance checks.
mod hooks;

/// The five kernel lifecycle hook points (`preModel`/`postModel`/`messagesChanged`/
/// `preToolUse`/`postToolUse`) and their verdict sum-types.
pub mod hook_manager;

/// Validated identifier newtypes (`AgentId`, `CallId`, `SnapshotId`) used throughout
/// the kernel's persisted data model and public API.
pub mod ids;

/// The kernel's persisted data model: breakpoints, tool call records, events, and
/// agent/snapshot metadata. The durable counterpart to `types`'s wire types.
pub mod model;

/// The `Store` persistence protocol plus the bundled `InMemoryStore` and `FileStore`
/// implementations.
pub mod store;

/// Tool-call permission evaluation (`deny`/`allow`/`require_approval` lists and
/// `auto`/`approval`/`readonly`/custom modes) and pending-approval bookkeeping.
pub mod permission;

/// Tool definition and execution system with automatic JSON schema generation.
/// Allows LLMs to call Rust functions with type-safe parameter handling.
pub mod tools;

/// Core type definitions for messages, content blocks, and agent configuration.
/// Includes builder patterns for ergonomic configuration and OpenAI API serialization.
pub mod types;

/// Internal utilities for Server-Sent Events (SSE) parsing and tool call aggregation.
/// Handles the low-level details of streaming response parsing.
mod utils;

/// Filesystem/command-execution surface consumed by built-in tools, plus the
/// bundled `InMemorySandbox` test double.
pub mod sandbox;

/// The `ModelProvider` trait and the bundled `OpenAiCompatibleProvider` adapter.
pub mod provider;

/// Bounded-concurrency tool dispatch: permission gating, hook gating, and
/// lifecycle bookkeeping for one batch of model-requested tool calls.
pub mod dispatcher;

/// Agent-visible to-do list with durable persistence and reminder ticks.
pub mod todo;

/// Step/interval/cron triggers polled once per agent-loop tick.
pub mod scheduler;

/// Re-enqueues a reminder when a `Sandbox`-watched path changes.
pub mod watcher;

/// Per-agent state machine driving the breakpoint loop end to end.
pub mod agent_loop;

/// Concurrent registry of running agents plus graceful shutdown/resume.
pub mod pool;

/// Mention-routed multi-agent room built on top of `AgentPool`.
pub mod room;

/// The `task_run` built-in tool for spawning and awaiting subagents.
pub mod builtin_tools;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================
// These items form the public API of the SDK. Everything else is internal.

/// Retry utilities with exponential backoff and jitter.
/// Made public as a module so users can access retry configuration and functions
/// for their own operations that need retry logic.
pub mod retry;

// --- Core Client API ---

pub use client::{Client, query};

// --- Provider Configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Lifecycle Hooks ---

pub use hooks::{
    HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_USER_PROMPT_SUBMIT, HookDecision, Hooks,
    PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent,
};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, tool};

// --- Identifiers ---

pub use ids::{AgentId, CallId, SnapshotId};

// --- Persisted Data Model ---

pub use model::{
    AgentInfo, ApprovalRecord, AuditEntry, Bookmark, Breakpoint, Channel, EventEnvelope,
    PermissionDecision, Snapshot, TodoItem, TodoStatus, ToolCallRecord, ToolCallState,
    ToolErrorType,
};

// --- Persistence Protocol ---

pub use store::{AgentLockGuard, FileStore, HealthReport, InMemoryStore, LockKind, Store};

// --- Event Bus ---

pub use events::{ApprovalSlot, EventBus, Subscription};

// --- Permissions ---

pub use permission::{
    CustomModeFn, PermissionConfig, PermissionManager, PermissionMode, PermissionModeKind,
    ResolvedApproval, Verdict,
};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, ContentBlock, ImageBlock, ImageDetail, Message,
    MessageRole, OpenAIContent, OpenAIContentPart, TextBlock, ToolResultBlock, ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use agent_kernel::prelude::*;` to get everything you need for typical usage.
///
/// This includes:
/// - Configuration: AgentOptions, AgentOptionsBuilder
/// - Client: Client, query()
/// - Content: ContentBlock, TextBlock, ToolUseBlock
/// - Tools: Tool, tool()
/// - Hooks: Hooks, HookDecision, hook event types
/// - Errors: Error, Result
pub mod prelude {
    pub use crate::{
        AgentOptions, AgentOptionsBuilder, Client, ContentBlock, Error, HookDecision, Hooks,
        PostToolUseEvent, PreToolUseEvent, Result, TextBlock, Tool, ToolUseBlock,
        UserPromptSubmitEvent, query, tool,
    };
}
