//! The five fixed lifecycle points hooks can observe or steer (spec §4.4).
//!
//! Generalizes [`crate::hooks::Hooks`]'s closure-registration pattern from three
//! points to five, and from a single `HookDecision` shape to a verdict sum-type
//! per point — `preToolUse` can deny/ask/substitute a result, `postToolUse` can
//! rewrite or replace the outcome, and the rest can veto or let a turn proceed
//! unmodified. First non-`None` verdict wins; a handler that errors is treated
//! as if it returned `None` (spec §7 "error-as-None").

use crate::model::ToolErrorType;
use crate::types::Message;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Fired before a model call is dispatched. Returning `Some` swaps the messages
/// that will actually be sent.
#[derive(Debug, Clone)]
pub struct PreModelEvent {
    pub agent_id: crate::ids::AgentId,
    pub messages: Vec<Message>,
}

/// Fired after a model call completes. Returning `Some` swaps the assistant
/// message that will be appended to history.
#[derive(Debug, Clone)]
pub struct PostModelEvent {
    pub agent_id: crate::ids::AgentId,
    pub response: Message,
}

/// Fired whenever the durable message history changes shape (append, truncate,
/// compression). Observational only — no verdict can alter the change itself.
#[derive(Debug, Clone)]
pub struct MessagesChangedEvent {
    pub agent_id: crate::ids::AgentId,
    pub message_count: usize,
}

/// Fired immediately before a tool call executes, after permission evaluation.
#[derive(Debug, Clone)]
pub struct PreToolUseEvent {
    pub call_id: crate::ids::CallId,
    pub tool_name: String,
    pub input: Value,
}

/// Fired immediately after a tool call executes (successfully or not).
#[derive(Debug, Clone)]
pub struct PostToolUseEvent {
    pub call_id: crate::ids::CallId,
    pub tool_name: String,
    pub input: Value,
    pub outcome: ToolOutcome,
}

/// The result half of a tool call, shared by `postToolUse` events and verdicts.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Ok(Value),
    Err { message: String, error_type: ToolErrorType },
}

/// What a `preToolUse` handler may decide.
#[derive(Debug, Clone)]
pub enum PreToolUseVerdict {
    /// Block the call entirely; `tool_result` (if any) is what the model sees
    /// in place of a real execution.
    Deny { reason: String, tool_result: Option<Value> },
    /// Route the call through `PermissionManager::await_approval` even if it
    /// would otherwise run automatically.
    Ask,
    /// Skip execution and hand the model this value directly.
    Result(Value),
}

/// What a `postToolUse` handler may decide.
#[derive(Debug, Clone)]
pub enum PostToolUseVerdict {
    /// Keep the real outcome but rewrite its payload before it reaches history.
    Update(Value),
    /// Replace the outcome wholesale (e.g. to redact a failure into a success).
    Replace(ToolOutcome),
}

macro_rules! handler_list {
    ($field:ident, $handler_ty:ident, $event_ty:ty, $verdict_ty:ty, $add_fn:ident, $exec_fn:ident) => {
        pub type $handler_ty = Arc<dyn Fn($event_ty) -> BoxFut<Option<$verdict_ty>> + Send + Sync>;

        impl HookManager {
            pub fn $add_fn<F, Fut>(mut self, handler: F) -> Self
            where
                F: Fn($event_ty) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Option<$verdict_ty>> + Send + 'static,
            {
                self.$field.push(Arc::new(move |event| Box::pin(handler(event))));
                self
            }

            pub async fn $exec_fn(&self, event: $event_ty) -> Option<$verdict_ty> {
                for handler in &self.$field {
                    if let Some(verdict) = handler(event.clone()).await {
                        return Some(verdict);
                    }
                }
                None
            }
        }
    };
}

/// Registry of lifecycle handlers for one agent, evaluated in registration order.
#[derive(Clone, Default)]
pub struct HookManager {
    pre_model: Vec<PreModelHandler>,
    post_model: Vec<PostModelHandler>,
    messages_changed: Vec<MessagesChangedHandler>,
    pre_tool_use: Vec<PreToolUseHandler>,
    post_tool_use: Vec<PostToolUseHandler>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }
}

handler_list!(pre_model, PreModelHandler, PreModelEvent, PreModelVerdictPlaceholder, add_pre_model, execute_pre_model);

// `preModel`/`postModel` verdicts are just replacement payloads; give them
// dedicated unit-like wrapper types so the macro's `Option<V>` shape still applies.
#[derive(Debug, Clone)]
pub struct PreModelVerdictPlaceholder(pub Vec<Message>);
#[derive(Debug, Clone)]
pub struct PostModelVerdict(pub Message);

handler_list!(post_model, PostModelHandler, PostModelEvent, PostModelVerdict, add_post_model, execute_post_model);
handler_list!(
    messages_changed,
    MessagesChangedHandler,
    MessagesChangedEvent,
    (),
    add_messages_changed,
    execute_messages_changed
);
handler_list!(
    pre_tool_use,
    PreToolUseHandler,
    PreToolUseEvent,
    PreToolUseVerdict,
    add_pre_tool_use,
    execute_pre_tool_use
);
handler_list!(
    post_tool_use,
    PostToolUseHandler,
    PostToolUseEvent,
    PostToolUseVerdict,
    add_post_tool_use,
    execute_post_tool_use
);

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("pre_model", &self.pre_model.len())
            .field("post_model", &self.post_model.len())
            .field("messages_changed", &self.messages_changed.len())
            .field("pre_tool_use", &self.pre_tool_use.len())
            .field("post_tool_use", &self.post_tool_use.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AgentId, CallId};

    #[tokio::test]
    async fn pre_tool_use_first_non_none_wins() {
        let mgr = HookManager::new()
            .add_pre_tool_use(|_event| async move { None })
            .add_pre_tool_use(|event| async move {
                if event.tool_name == "rm" {
                    Some(PreToolUseVerdict::Deny {
                        reason: "blocked".into(),
                        tool_result: None,
                    })
                } else {
                    None
                }
            });

        let event = PreToolUseEvent {
            call_id: CallId::generate(),
            tool_name: "rm".into(),
            input: serde_json::json!({}),
        };
        let verdict = mgr.execute_pre_tool_use(event).await;
        assert!(matches!(verdict, Some(PreToolUseVerdict::Deny { .. })));
    }

    #[tokio::test]
    async fn post_tool_use_can_replace_outcome() {
        let mgr = HookManager::new().add_post_tool_use(|_event| async move {
            Some(PostToolUseVerdict::Replace(ToolOutcome::Err {
                message: "redacted".into(),
                error_type: ToolErrorType::Runtime,
            }))
        });

        let event = PostToolUseEvent {
            call_id: CallId::generate(),
            tool_name: "read_secret".into(),
            input: serde_json::json!({}),
            outcome: ToolOutcome::Ok(serde_json::json!("secret")),
        };
        let verdict = mgr.execute_post_tool_use(event).await;
        assert!(matches!(verdict, Some(PostToolUseVerdict::Replace(_))));
    }

    #[tokio::test]
    async fn messages_changed_is_observational() {
        let mgr = HookManager::new().add_messages_changed(|_event| async move { None });
        let event = MessagesChangedEvent {
            agent_id: AgentId::generate(),
            message_count: 3,
        };
        assert!(mgr.execute_messages_changed(event).await.is_none());
    }

    #[tokio::test]
    async fn no_handlers_returns_none() {
        let mgr = HookManager::new();
        let event = PreToolUseEvent {
            call_id: CallId::generate(),
            tool_name: "noop".into(),
            input: serde_json::json!({}),
        };
        assert!(mgr.execute_pre_tool_use(event).await.is_none());
    }
}
