//! Tool dispatch pipeline (spec §4.5).
//!
//! One model turn can request several tool calls at once. `ToolDispatcher` runs
//! them with bounded concurrency (a `tokio::sync::Semaphore`, default fan-out 4),
//! serializes mutating calls per agent so two non-readonly tools never race
//! against each other's side effects, and reconstructs the model-requested order
//! on the way out via index-tagged `futures::future::join_all` — the same shape
//! the teacher's `client.rs` uses for its auto-execute buffer, generalized from
//! "run one tool" to "run N tools, gated by permissions and hooks."

use crate::events::EventBus;
use crate::hook_manager::{
    HookManager, PostToolUseEvent, PostToolUseVerdict, PreToolUseEvent, PreToolUseVerdict,
    ToolOutcome,
};
use crate::ids::{AgentId, CallId};
use crate::model::{Channel, ToolCallRecord, ToolCallState, ToolErrorType};
use crate::permission::{PermissionManager, Verdict};
use crate::tools::Tool;
use crate::{Error, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

/// One tool invocation requested by the model, in the order it appeared.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub call_id: CallId,
    pub tool_name: String,
    pub input: Value,
}

/// The settled outcome of one dispatched call, still tagged with its position.
pub struct DispatchedCall {
    pub call_id: CallId,
    pub record: ToolCallRecord,
}

/// What a caller must supply so the dispatcher can gate and observe each call.
pub struct DispatchContext<'a> {
    pub permissions: &'a PermissionManager,
    pub hooks: &'a HookManager,
    pub events: &'a EventBus,
    pub agent_id: &'a AgentId,
}

/// Publishes a `state_changed` snapshot for one `ToolCallRecord` transition.
/// Best-effort: a store failure here must never abort the tool call itself.
async fn emit_state_changed(ctx: &DispatchContext<'_>, call_id: &CallId, tool_name: &str, state: ToolCallState) {
    let _ = ctx
        .events
        .publish(
            ctx.agent_id,
            Channel::Monitor,
            json!({"type": "state_changed", "call_id": call_id.to_string(), "tool_name": tool_name, "state": state}),
        )
        .await;
}

/// Default number of tool calls the dispatcher will run concurrently.
pub const DEFAULT_FANOUT: usize = 4;

/// Runs one batch of tool calls to completion, honoring permission verdicts,
/// `preToolUse`/`postToolUse` hooks, and a configurable concurrency cap.
///
/// Non-readonly (mutating) calls against the same agent are serialized through
/// an internal per-dispatcher `tokio::sync::Mutex` so e.g. two `write_file`
/// calls in one turn never interleave; readonly calls still run concurrently
/// with each other and with the mutex-held call.
pub struct ToolDispatcher {
    tools: HashMap<String, Tool>,
    fanout: Arc<Semaphore>,
    mutation_lock: Arc<AsyncMutex<()>>,
}

impl ToolDispatcher {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self::with_fanout(tools, DEFAULT_FANOUT)
    }

    pub fn with_fanout(tools: Vec<Tool>, fanout: usize) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name().to_string(), t)).collect(),
            fanout: Arc::new(Semaphore::new(fanout.max(1))),
            mutation_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Dispatches every request in `requests`, preserving input order in the
    /// returned vector regardless of completion order.
    pub async fn dispatch(
        &self,
        requests: Vec<ToolRequest>,
        ctx: DispatchContext<'_>,
    ) -> Vec<DispatchedCall> {
        let futures = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let ctx = &ctx;
                async move {
                    let record = self.dispatch_one(request, ctx).await;
                    (index, record)
                }
            })
            .collect::<Vec<_>>();

        let mut results = futures::future::join_all(futures).await;
        results.sort_by_key(|(index, _)| *index);

        for (_, dispatched) in &results {
            self.emit_terminal_events(&ctx, dispatched).await;
        }

        results
            .into_iter()
            .map(|(_, dispatched)| dispatched)
            .collect()
    }

    /// Emits the monitor `tool_executed` snapshot and the matching progress
    /// `tool:end`/`tool:error` for one call's terminal state (spec §4.5 item 6).
    async fn emit_terminal_events(&self, ctx: &DispatchContext<'_>, dispatched: &DispatchedCall) {
        let record = &dispatched.record;
        let _ = ctx
            .events
            .publish(
                ctx.agent_id,
                Channel::Monitor,
                json!({"type": "tool_executed", "call_id": dispatched.call_id.to_string(), "tool_name": record.tool_name, "state": record.state}),
            )
            .await;

        match record.state {
            ToolCallState::Completed => {
                let _ = ctx
                    .events
                    .publish(
                        ctx.agent_id,
                        Channel::Progress,
                        json!({"type": "tool:end", "call_id": dispatched.call_id.to_string(), "tool_name": record.tool_name, "result": record.result}),
                    )
                    .await;
            }
            ToolCallState::Failed | ToolCallState::Denied => {
                let _ = ctx
                    .events
                    .publish(
                        ctx.agent_id,
                        Channel::Progress,
                        json!({"type": "tool:error", "call_id": dispatched.call_id.to_string(), "tool_name": record.tool_name, "error": record.error, "error_type": record.error_type}),
                    )
                    .await;
            }
            _ => {}
        }
    }

    async fn dispatch_one(&self, request: ToolRequest, ctx: &DispatchContext<'_>) -> DispatchedCall {
        let mut record = ToolCallRecord::new(request.call_id.clone(), &request.tool_name, request.input.clone());

        let Some(tool) = self.tools.get(&request.tool_name) else {
            record.error = Some(format!("unknown tool: {}", request.tool_name));
            record.error_type = Some(ToolErrorType::Validation);
            record.transition(ToolCallState::Failed, Some("unknown tool".into()));
            emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Failed).await;
            return DispatchedCall { call_id: request.call_id, record };
        };

        let pre_verdict = ctx
            .hooks
            .execute_pre_tool_use(PreToolUseEvent {
                call_id: request.call_id.clone(),
                tool_name: request.tool_name.clone(),
                input: request.input.clone(),
            })
            .await;

        match pre_verdict {
            Some(PreToolUseVerdict::Deny { reason, tool_result }) => {
                record.error = Some(reason.clone());
                record.error_type = Some(ToolErrorType::Validation);
                record.result = tool_result;
                record.transition(ToolCallState::Denied, Some(reason));
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Denied).await;
                return DispatchedCall { call_id: request.call_id, record };
            }
            Some(PreToolUseVerdict::Result(value)) => {
                record.result = Some(value);
                record.transition(ToolCallState::Completed, Some("short-circuited by hook".into()));
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Completed).await;
                self.run_post_hook(ctx, &request, &mut record).await;
                return DispatchedCall { call_id: request.call_id, record };
            }
            Some(PreToolUseVerdict::Ask) | None => {}
        }

        let forced_approval = matches!(pre_verdict, Some(PreToolUseVerdict::Ask));
        let verdict = if forced_approval {
            Verdict::RequireApproval
        } else {
            ctx.permissions
                .evaluate(&request.tool_name, &request.input, tool.is_readonly() || tool.is_no_effect())
                .await
        };

        match verdict {
            Verdict::Deny => {
                record.error = Some(format!("denied by permission policy: {}", request.tool_name));
                record.error_type = Some(ToolErrorType::Validation);
                record.transition(ToolCallState::Denied, Some("permission denied".into()));
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Denied).await;
                return DispatchedCall { call_id: request.call_id, record };
            }
            Verdict::RequireApproval => {
                record.approval.required = true;
                record.transition(ToolCallState::ApprovalRequired, None);
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::ApprovalRequired).await;
                let _ = ctx
                    .events
                    .publish(
                        ctx.agent_id,
                        Channel::Control,
                        json!({"type": "permission_required", "call_id": request.call_id.to_string(), "tool_name": request.tool_name, "input": request.input}),
                    )
                    .await;
                let rx = ctx.permissions.await_approval(
                    request.call_id.clone(),
                    request.tool_name.clone(),
                    request.input.clone(),
                );
                match rx.await {
                    Ok(resolved) => {
                        record.approval.decision = Some(resolved.decision);
                        record.approval.decider = resolved.decider.clone();
                        record.approval.note = resolved.note.clone();
                        let _ = ctx
                            .events
                            .publish(
                                ctx.agent_id,
                                Channel::Control,
                                json!({
                                    "type": "permission_decided",
                                    "call_id": request.call_id.to_string(),
                                    "decision": resolved.decision,
                                    "decider": resolved.decider,
                                    "note": resolved.note,
                                }),
                            )
                            .await;
                        match resolved.decision {
                            crate::model::PermissionDecision::Deny => {
                                record.error = Some(
                                    resolved.note.unwrap_or_else(|| "denied by approver".into()),
                                );
                                record.error_type = Some(ToolErrorType::Validation);
                                record.transition(ToolCallState::Denied, None);
                                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Denied).await;
                                return DispatchedCall { call_id: request.call_id, record };
                            }
                            crate::model::PermissionDecision::Allow => {
                                record.transition(ToolCallState::Approved, None);
                                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Approved).await;
                            }
                        }
                    }
                    Err(_) => {
                        record.error = Some("approval channel closed before decision".into());
                        record.error_type = Some(ToolErrorType::Aborted);
                        record.transition(ToolCallState::Denied, Some("approval channel closed".into()));
                        emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Denied).await;
                        return DispatchedCall { call_id: request.call_id, record };
                    }
                }
            }
            Verdict::Allow => {}
        }

        self.run_tool(tool, request, ctx, record).await
    }

    async fn run_tool(
        &self,
        tool: &Tool,
        request: ToolRequest,
        ctx: &DispatchContext<'_>,
        mut record: ToolCallRecord,
    ) -> DispatchedCall {
        let is_mutating = !(tool.is_readonly() || tool.is_no_effect());

        let _fanout_permit = self.fanout.acquire().await;
        let _mutation_guard = if is_mutating {
            Some(self.mutation_lock.lock().await)
        } else {
            None
        };

        record.started_at = Some(chrono::Utc::now());
        record.transition(ToolCallState::PreTool, None);
        emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::PreTool).await;
        record.transition(ToolCallState::ToolExecuting, None);
        emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::ToolExecuting).await;
        let _ = ctx
            .events
            .publish(
                ctx.agent_id,
                Channel::Progress,
                json!({"type": "tool:start", "call_id": request.call_id.to_string(), "tool_name": request.tool_name}),
            )
            .await;

        let outcome = match tool.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, tool.execute(request.input.clone())).await {
                Ok(result) => result,
                Err(_) => Err(Error::tool(format!("tool '{}' timed out", request.tool_name))),
            },
            None => tool.execute(request.input.clone()).await,
        };

        record.ended_at = Some(chrono::Utc::now());

        match outcome {
            Ok(value) => {
                record.result = Some(value);
                record.transition(ToolCallState::Completed, None);
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Completed).await;
            }
            Err(err) => {
                record.error = Some(err.to_string());
                record.error_type = Some(classify_error(&err));
                record.transition(ToolCallState::Failed, None);
                emit_state_changed(ctx, &request.call_id, &request.tool_name, ToolCallState::Failed).await;
                let _ = ctx
                    .events
                    .publish(
                        ctx.agent_id,
                        Channel::Monitor,
                        json!({"type": "error", "severity": "error", "phase": "tool", "message": record.error.clone(), "detail": request.tool_name}),
                    )
                    .await;
            }
        }

        self.run_post_hook(ctx, &request, &mut record).await;
        self.emit_custom_event(ctx, &request, &mut record).await;

        DispatchedCall { call_id: request.call_id, record }
    }

    /// Tools may smuggle a monitor-channel notification out via a reserved
    /// `custom_event` key in their result object (spec §4.5 item 7); if present,
    /// it's published as `tool_custom_event` and stripped before the model sees it.
    async fn emit_custom_event(&self, ctx: &DispatchContext<'_>, request: &ToolRequest, record: &mut ToolCallRecord) {
        let Some(Value::Object(map)) = &mut record.result else {
            return;
        };
        let Some(custom) = map.remove("custom_event") else {
            return;
        };
        let _ = ctx
            .events
            .publish(
                ctx.agent_id,
                Channel::Monitor,
                json!({"type": "tool_custom_event", "call_id": request.call_id.to_string(), "tool_name": request.tool_name, "data": custom}),
            )
            .await;
    }

    async fn run_post_hook(&self, ctx: &DispatchContext<'_>, request: &ToolRequest, record: &mut ToolCallRecord) {
        let outcome = match (&record.result, &record.error) {
            (_, Some(message)) => ToolOutcome::Err {
                message: message.clone(),
                error_type: record.error_type.unwrap_or(ToolErrorType::Runtime),
            },
            (Some(value), None) => ToolOutcome::Ok(value.clone()),
            (None, None) => ToolOutcome::Ok(Value::Null),
        };

        let verdict = ctx
            .hooks
            .execute_post_tool_use(PostToolUseEvent {
                call_id: request.call_id.clone(),
                tool_name: request.tool_name.clone(),
                input: request.input.clone(),
                outcome,
            })
            .await;

        match verdict {
            Some(PostToolUseVerdict::Update(value)) => {
                record.result = Some(value);
                record.error = None;
                record.error_type = None;
            }
            Some(PostToolUseVerdict::Replace(ToolOutcome::Ok(value))) => {
                record.result = Some(value);
                record.error = None;
                record.error_type = None;
            }
            Some(PostToolUseVerdict::Replace(ToolOutcome::Err { message, error_type })) => {
                record.result = None;
                record.error = Some(message);
                record.error_type = Some(error_type);
            }
            None => {}
        }
    }
}

/// Maps a dispatch-time [`Error`] to the taxonomy `ToolCallRecord` persists
/// (spec §4.5 item 5). Tool handler errors surface as `Runtime` by default;
/// callers that need finer classification should return a typed error from
/// their handler and are encouraged to match on it before calling `execute`.
fn classify_error(err: &Error) -> ToolErrorType {
    match err {
        Error::InvalidInput(_) => ToolErrorType::Validation,
        Error::Timeout => ToolErrorType::Aborted,
        _ => ToolErrorType::Runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionConfig;
    use crate::store::InMemoryStore;
    use crate::tools::tool;
    use serde_json::json;

    fn dispatcher_with(tools: Vec<Tool>) -> ToolDispatcher {
        ToolDispatcher::new(tools)
    }

    fn test_bus() -> (EventBus, AgentId) {
        (EventBus::new(Arc::new(InMemoryStore::new())), AgentId::generate())
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_touching_permissions() {
        let dispatcher = dispatcher_with(vec![]);
        let permissions = PermissionManager::new(PermissionConfig::default());
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let requests = vec![ToolRequest {
            call_id: CallId::generate(),
            tool_name: "nope".into(),
            input: json!({}),
        }];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.state, ToolCallState::Failed);
    }

    #[tokio::test]
    async fn allowed_tool_runs_and_completes() {
        let echo = tool("echo", "echoes input").build(|args| async move { Ok(args) });
        let dispatcher = dispatcher_with(vec![echo]);
        let permissions = PermissionManager::new(PermissionConfig::default());
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let requests = vec![ToolRequest {
            call_id: CallId::generate(),
            tool_name: "echo".into(),
            input: json!({"x": 1}),
        }];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        assert_eq!(results[0].record.state, ToolCallState::Completed);
        assert_eq!(results[0].record.result, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn denied_tool_never_executes() {
        let boom = tool("boom", "should never run").build(|_args| async move {
            panic!("must not execute a denied tool")
        });
        let dispatcher = dispatcher_with(vec![boom]);
        let permissions = PermissionManager::new(PermissionConfig {
            deny_tools: vec!["boom".into()],
            ..Default::default()
        });
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let requests = vec![ToolRequest {
            call_id: CallId::generate(),
            tool_name: "boom".into(),
            input: json!({}),
        }];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        assert_eq!(results[0].record.state, ToolCallState::Denied);
    }

    #[tokio::test]
    async fn dispatch_preserves_input_order() {
        let make_tool = |name: &'static str, delay_ms: u64| {
            tool(name, "delayed echo").build(move |args| async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok(args)
            })
        };
        let dispatcher = dispatcher_with(vec![make_tool("slow", 20), make_tool("fast", 1)]);
        let permissions = PermissionManager::new(PermissionConfig::default());
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let requests = vec![
            ToolRequest { call_id: CallId::generate(), tool_name: "slow".into(), input: json!(1) },
            ToolRequest { call_id: CallId::generate(), tool_name: "fast".into(), input: json!(2) },
        ];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        assert_eq!(results[0].record.tool_name, "slow");
        assert_eq!(results[1].record.tool_name, "fast");
    }

    #[tokio::test]
    async fn approval_required_blocks_until_decided() {
        let echo = tool("echo", "echo").build(|args| async move { Ok(args) });
        let dispatcher = dispatcher_with(vec![echo]);
        let permissions = Arc::new(PermissionManager::new(PermissionConfig {
            require_approval_tools: vec!["echo".into()],
            ..Default::default()
        }));
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let call_id = CallId::generate();

        let permissions_clone = permissions.clone();
        let call_id_clone = call_id.clone();
        let decider = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            permissions_clone
                .decide(&call_id_clone, crate::model::PermissionDecision::Allow, None, None)
                .unwrap();
        });

        let requests = vec![ToolRequest { call_id, tool_name: "echo".into(), input: json!({}) }];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        decider.await.unwrap();
        assert_eq!(results[0].record.state, ToolCallState::Completed);
    }

    #[tokio::test]
    async fn custom_event_is_stripped_from_result_and_published() {
        let emitter = tool("emitter", "emits a custom event").build(|_args| async move {
            Ok(json!({"ok": true, "custom_event": {"kind": "progress", "pct": 50}}))
        });
        let dispatcher = dispatcher_with(vec![emitter]);
        let permissions = PermissionManager::new(PermissionConfig::default());
        let hooks = HookManager::new();
        let (events, agent_id) = test_bus();
        let requests = vec![ToolRequest {
            call_id: CallId::generate(),
            tool_name: "emitter".into(),
            input: json!({}),
        }];
        let results = dispatcher
            .dispatch(requests, DispatchContext { permissions: &permissions, hooks: &hooks, events: &events, agent_id: &agent_id })
            .await;
        let result = results[0].record.result.clone().unwrap();
        assert!(result.get("custom_event").is_none());
        assert_eq!(result["ok"], json!(true));

        let mut sub = events.subscribe(&agent_id, vec![Channel::Monitor], None).await.unwrap();
        let mut saw_custom = false;
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(10), sub.next()).await {
                Ok(Ok(Some(event))) => {
                    if event.payload["type"] == "tool_custom_event" {
                        saw_custom = true;
                    }
                }
                _ => break,
            }
        }
        assert!(saw_custom);
    }
}
