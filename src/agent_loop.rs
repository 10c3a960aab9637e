//! The per-agent breakpoint state machine (spec §3, §4.6, §4.8).
//!
//! `AgentLoop` is the generalization of the teacher's `Client`: where `Client`
//! holds a flat `history: Vec<Message>` and drives one request/response pair
//! at a time, `AgentLoop` drives the full eight-`Breakpoint` lifecycle,
//! persists every transition through a `Store` before acting on it, and
//! publishes every change onto an `EventBus` so a crashed-and-resumed process
//! picks up exactly where the event log says it left off.

use crate::context::ContextManager;
use crate::dispatcher::{DispatchContext, ToolDispatcher, ToolRequest};
use crate::events::EventBus;
use crate::hook_manager::{HookManager, MessagesChangedEvent, PostModelEvent, PostModelVerdict, PreModelEvent};
use crate::ids::{AgentId, CallId};
use crate::model::{AgentInfo, Breakpoint, Channel, ToolCallState};
use crate::permission::PermissionManager;
use crate::provider::{ModelChunk, ModelContext, ModelProvider};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::todo::TodoManager;
use crate::types::{AgentOptions, ContentBlock, Message, ResumeStrategy, ToolResultBlock};
use crate::watcher::FileWatcher;
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One thing waiting to be processed by the loop.
#[derive(Debug, Clone)]
pub enum QueuedMessage {
    User(String),
    Reminder { source: String },
    SchedulerTrigger { id: String },
}

/// Everything one running agent needs, wired together once at construction.
pub struct AgentLoop {
    agent_id: AgentId,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    provider: Arc<dyn ModelProvider>,
    dispatcher: ToolDispatcher,
    permissions: PermissionManager,
    hooks: HookManager,
    context: ContextManager,
    options: AgentOptions,
    scheduler: Mutex<Scheduler>,
    todo: TodoManager,
    watcher: Mutex<Option<FileWatcher>>,

    messages: Mutex<Vec<Message>>,
    breakpoint: Mutex<Breakpoint>,
    last_sfp_index: Mutex<usize>,
    last_manual_hash: Mutex<Option<String>>,
    interrupted: Arc<AtomicBool>,

    queue_tx: mpsc::UnboundedSender<QueuedMessage>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
}

impl AgentLoop {
    pub fn new(
        agent_id: AgentId,
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        provider: Arc<dyn ModelProvider>,
        options: AgentOptions,
    ) -> Self {
        let tools: Vec<_> = options.tools().iter().map(|t| (**t).clone()).collect();
        let dispatcher = ToolDispatcher::with_fanout(tools, options.kernel().tool_fanout);
        let permissions = PermissionManager::new(options.kernel().permission.clone());
        let todo = TodoManager::new(agent_id.clone(), store.clone(), options.kernel().todo.clone());
        let context = ContextManager::new(options.kernel().context.clone());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            agent_id,
            store,
            events,
            provider,
            dispatcher,
            permissions,
            hooks: HookManager::new(),
            context,
            options,
            scheduler: Mutex::new(Scheduler::new()),
            todo,
            watcher: Mutex::new(None),
            messages: Mutex::new(Vec::new()),
            breakpoint: Mutex::new(Breakpoint::Ready),
            last_sfp_index: Mutex::new(0),
            last_manual_hash: Mutex::new(None),
            interrupted: Arc::new(AtomicBool::new(false)),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn enqueue(&self, message: QueuedMessage) {
        // Receiver is only ever dropped when this loop is itself gone.
        let _ = self.queue_tx.send(message);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub async fn history(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    pub async fn current_breakpoint(&self) -> Breakpoint {
        *self.breakpoint.lock().await
    }

    /// Rehydrates from the `Store`, applying the auto-seal crash-recovery
    /// rules of spec §7: a process that died mid-tool-call either seals the
    /// record where it stood or marks it denied, depending on which state it
    /// was frozen in; only `Ready`/`AwaitingApproval` are legitimate resting
    /// points and need no repair at all.
    pub async fn resume_from_store(&self) -> Result<()> {
        let messages = self.store.load_messages(&self.agent_id).await?;
        *self.messages.lock().await = messages;

        let info = self.store.load_info(&self.agent_id).await?;
        let Some(mut info) = info else {
            return Ok(());
        };

        if info.breakpoint.is_mid_tool() {
            let mut records = self.store.load_tool_records(&self.agent_id).await?;
            let mut sealed = Vec::new();
            for record in records.iter_mut() {
                match record.state {
                    ToolCallState::Pending => record.transition(ToolCallState::Sealed, Some("auto-sealed on crash recovery".into())),
                    ToolCallState::ApprovalRequired => record.transition(ToolCallState::Denied, Some("auto-denied: approval pending at crash".into())),
                    ToolCallState::Approved | ToolCallState::Executing => {
                        record.transition(ToolCallState::Sealed, Some("auto-sealed on crash recovery".into()))
                    }
                    _ => {}
                }
                if record.state == ToolCallState::Sealed {
                    sealed.push(record.id.to_string());
                }
            }
            self.store.save_tool_records(&self.agent_id, &records).await?;
            info.breakpoint = Breakpoint::Ready;
            self.store.save_info(&info).await?;

            let strategy = match self.options.kernel().resume.strategy {
                ResumeStrategy::Crash => "crash",
                ResumeStrategy::Manual => "manual",
            };
            self.events
                .publish(
                    &self.agent_id,
                    Channel::Monitor,
                    json!({"type": "agent_resumed", "strategy": strategy, "sealed": sealed}),
                )
                .await?;

            for record in records.iter().filter(|r| r.state == ToolCallState::Sealed) {
                self.events
                    .publish(
                        &self.agent_id,
                        Channel::Progress,
                        json!({
                            "type": "tool:end",
                            "call_id": record.id.to_string(),
                            "tool_name": record.tool_name,
                            "result": json!({"error": record.error.clone().unwrap_or_else(|| "sealed on crash recovery".into())}),
                        }),
                    )
                    .await?;
            }
        }

        *self.breakpoint.lock().await = info.breakpoint;
        *self.last_sfp_index.lock().await = info.last_sfp_index;
        Ok(())
    }

    async fn transition(&self, next: Breakpoint) -> Result<()> {
        *self.breakpoint.lock().await = next;
        self.events
            .publish(&self.agent_id, Channel::Monitor, json!({"type": "breakpoint_changed", "breakpoint": next}))
            .await?;
        self.persist_info(next).await
    }

    async fn persist_info(&self, breakpoint: Breakpoint) -> Result<()> {
        let mut info = self
            .store
            .load_info(&self.agent_id)
            .await?
            .unwrap_or_else(|| AgentInfo::new(self.agent_id.clone(), "default", "1"));
        info.breakpoint = breakpoint;
        info.message_count = self.messages.lock().await.len();
        info.last_sfp_index = *self.last_sfp_index.lock().await;
        self.store.save_info(&info).await
    }

    /// Pulls and processes exactly one queued item, running it through the
    /// full breakpoint lifecycle. Returns `Ok(false)` when the queue is empty
    /// (no-op, not an error) so callers can drive the loop in a `while` without
    /// busy-spinning on an empty channel.
    pub async fn step(&self) -> Result<bool> {
        let next = self.queue_rx.lock().await.try_recv();
        let message = match next {
            Ok(m) => m,
            Err(mpsc::error::TryRecvError::Empty) => return self.poll_ambient_triggers().await,
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(false),
        };

        self.interrupted.store(false, Ordering::SeqCst);
        let prompt = match message {
            QueuedMessage::User(text) => text,
            QueuedMessage::Reminder { source } => format!("[reminder: {source}]"),
            QueuedMessage::SchedulerTrigger { id } => format!("[scheduler: {id}]"),
        };

        {
            let mut messages = self.messages.lock().await;
            messages.push(Message::user(prompt));
        }
        self.save_messages().await?;

        self.run_turn().await?;
        Ok(true)
    }

    /// Checks the to-do ticker, scheduler, and file watcher without consuming
    /// a user-originated message; called when the queue is otherwise empty.
    async fn poll_ambient_triggers(&self) -> Result<bool> {
        if let Some(event) = self.todo.tick_step() {
            let is_reminder = matches!(event, crate::todo::TodoEvent::Reminder { .. });
            self.publish_todo_event(event).await?;
            if is_reminder {
                self.enqueue(QueuedMessage::Reminder { source: "todo".into() });
                self.publish_reminder_sent("todo").await?;
            }
        }

        let due = self.scheduler.lock().await.poll_step(chrono::Utc::now());
        for trigger in due {
            self.events
                .publish(&self.agent_id, Channel::Monitor, json!({"type": "scheduler_triggered", "id": trigger.id}))
                .await?;
            self.enqueue(QueuedMessage::SchedulerTrigger { id: trigger.id.clone() });
            self.publish_reminder_sent("scheduler").await?;
        }

        if let Some(watcher) = self.watcher.lock().await.as_ref() {
            let changed = watcher.drain_changes();
            if !changed.is_empty() {
                self.events
                    .publish(
                        &self.agent_id,
                        Channel::Monitor,
                        json!({"type": "file_changed", "paths": changed.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()}),
                    )
                    .await?;
                self.enqueue(QueuedMessage::Reminder { source: "file_changed".into() });
                self.publish_reminder_sent("file_changed").await?;
            }
        }

        Ok(false)
    }

    async fn publish_todo_event(&self, event: crate::todo::TodoEvent) -> Result<()> {
        let payload = match event {
            crate::todo::TodoEvent::Changed { todos } => json!({"type": "todo_changed", "todos": todos}),
            crate::todo::TodoEvent::Reminder { open_count } => json!({"type": "todo_reminder", "open_count": open_count}),
        };
        self.events.publish(&self.agent_id, Channel::Monitor, payload).await?;
        Ok(())
    }

    async fn publish_reminder_sent(&self, source: &str) -> Result<()> {
        self.events
            .publish(&self.agent_id, Channel::Monitor, json!({"type": "reminder_sent", "source": source}))
            .await?;
        Ok(())
    }

    /// Drives one model turn to completion, including every tool round-trip
    /// it requests, up to `max_tool_iterations`.
    async fn run_turn(&self) -> Result<()> {
        for iteration in 0..self.options.max_tool_iterations().max(1) {
            if self.interrupted.load(Ordering::SeqCst) {
                self.transition(Breakpoint::Ready).await?;
                self.publish_progress_done("interrupted").await?;
                return Ok(());
            }

            self.transition(Breakpoint::PreModel).await?;
            let message = self.stream_model_turn().await?;

            let has_tool_use = message.content.iter().any(|b| matches!(b, ContentBlock::ToolUse(_)));
            let content_for_tools = message.content.clone();

            {
                let mut messages = self.messages.lock().await;
                messages.push(message);
            }
            self.save_messages().await?;
            self.notify_messages_changed().await?;

            if !has_tool_use {
                self.transition(Breakpoint::Ready).await?;
                self.mark_sfp().await?;
                self.publish_step_complete().await?;
                self.publish_progress_done("completed").await?;
                return Ok(());
            }

            self.transition(Breakpoint::ToolPending).await?;
            self.run_tool_round(&content_for_tools).await?;

            if iteration + 1 == self.options.max_tool_iterations().max(1) {
                self.publish_progress_done("max_iterations").await?;
            }
        }

        self.transition(Breakpoint::Ready).await?;
        Ok(())
    }

    async fn publish_progress_done(&self, reason: &str) -> Result<()> {
        self.events
            .publish(&self.agent_id, Channel::Progress, json!({"type": "done", "reason": reason}))
            .await?;
        Ok(())
    }

    async fn publish_step_complete(&self) -> Result<()> {
        self.events.publish(&self.agent_id, Channel::Monitor, json!({"type": "step_complete"})).await?;
        Ok(())
    }

    async fn notify_messages_changed(&self) -> Result<()> {
        let message_count = self.messages.lock().await.len();
        self.hooks
            .execute_messages_changed(MessagesChangedEvent { agent_id: self.agent_id.clone(), message_count })
            .await;
        Ok(())
    }

    async fn publish_context_event(&self, event: crate::context::ContextEvent) -> Result<()> {
        use crate::context::ContextEvent;
        let payload = match event {
            ContextEvent::CompressionStarted { before_tokens } => {
                json!({"type": "context_compression", "phase": "started", "before_tokens": before_tokens})
            }
            ContextEvent::CompressionFinished { after_tokens, ratio, summary } => {
                json!({"type": "context_compression", "phase": "finished", "after_tokens": after_tokens, "ratio": ratio, "summary": summary})
            }
            ContextEvent::ToolManualUpdated { hash } => json!({"type": "tool_manual_updated", "hash": hash}),
        };
        self.events.publish(&self.agent_id, Channel::Monitor, payload).await?;
        Ok(())
    }

    /// Hashes the currently registered tools' names and descriptions so a
    /// change in the tool manual (spec §4.7) can be surfaced as an event
    /// without resending the whole manual every turn.
    fn tool_manual_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        for tool in self.options.tools() {
            tool.name().hash(&mut hasher);
            tool.description().hash(&mut hasher);
        }
        format!("{:x}", hasher.finish())
    }

    async fn maybe_publish_tool_manual_updated(&self) -> Result<()> {
        let hash = self.tool_manual_hash();
        let mut last = self.last_manual_hash.lock().await;
        if last.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }
        *last = Some(hash.clone());
        drop(last);
        self.publish_context_event(crate::context::ContextEvent::ToolManualUpdated { hash }).await
    }

    async fn publish_block_chunk(&self, block: &ContentBlock) -> Result<()> {
        match block {
            ContentBlock::Text(t) => {
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "text_chunk_start"}))
                    .await?;
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "text_chunk", "text": t.text}))
                    .await?;
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "text_chunk_end"}))
                    .await?;
            }
            ContentBlock::Reasoning(r) => {
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "think_chunk_start"}))
                    .await?;
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "think_chunk", "text": r.text}))
                    .await?;
                self.events
                    .publish(&self.agent_id, Channel::Progress, json!({"type": "think_chunk_end"}))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn stream_model_turn(&self) -> Result<Message> {
        self.transition(Breakpoint::StreamingModel).await?;

        self.maybe_publish_tool_manual_updated().await?;

        let raw_messages = self.messages.lock().await.clone();
        let (assembled, context_events) = self.context.assemble(&raw_messages);
        for event in context_events {
            self.publish_context_event(event).await?;
        }

        let pre_model_verdict = self
            .hooks
            .execute_pre_model(PreModelEvent { agent_id: self.agent_id.clone(), messages: assembled.clone() })
            .await;
        let outgoing = match pre_model_verdict {
            Some(crate::hook_manager::PreModelVerdictPlaceholder(messages)) => messages,
            None => assembled,
        };

        let ctx = ModelContext {
            system_prompt: self.options.system_prompt().to_string(),
            messages: outgoing,
            tools: self.options.tools().iter().map(|t| (**t).clone()).collect(),
            model: self.options.model().to_string(),
            max_tokens: self.options.max_tokens(),
            temperature: self.options.temperature(),
        };

        let mut stream = self.provider.stream_complete(ctx).await?;
        let mut blocks = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::Block(block) => {
                    self.publish_block_chunk(&block).await?;
                    blocks.push(block);
                }
                ModelChunk::Done { usage } => {
                    if let Some(usage) = usage {
                        self.events
                            .publish(
                                &self.agent_id,
                                Channel::Monitor,
                                json!({
                                    "type": "token_usage",
                                    "prompt_tokens": usage.prompt_tokens,
                                    "completion_tokens": usage.completion_tokens,
                                    "total_tokens": usage.total_tokens,
                                }),
                            )
                            .await?;
                    }
                    break;
                }
            }
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
        }

        let message = Message::assistant(blocks);
        let post_model_verdict = self
            .hooks
            .execute_post_model(PostModelEvent { agent_id: self.agent_id.clone(), response: message.clone() })
            .await;
        let message = match post_model_verdict {
            Some(PostModelVerdict(replacement)) => replacement,
            None => message,
        };

        Ok(self.context.transform_reasoning(message))
    }

    async fn run_tool_round(&self, blocks: &[ContentBlock]) -> Result<()> {
        let requests: Vec<ToolRequest> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse(t) => Some(ToolRequest {
                    call_id: CallId::from_existing(t.id.clone()).unwrap_or_else(|_| CallId::generate()),
                    tool_name: t.name.clone(),
                    input: t.input.clone(),
                }),
                _ => None,
            })
            .collect();

        if requests.iter().any(|_| true) {
            self.transition(Breakpoint::AwaitingApproval).await?;
        }

        let dispatched = self
            .dispatcher
            .dispatch(
                requests,
                DispatchContext {
                    permissions: &self.permissions,
                    hooks: &self.hooks,
                    events: &self.events,
                    agent_id: &self.agent_id,
                },
            )
            .await;

        self.transition(Breakpoint::PostTool).await?;

        let mut tool_results = Vec::with_capacity(dispatched.len());
        for call in &dispatched {
            let value = call.record.result.clone().unwrap_or_else(|| {
                json!({"error": call.record.error.clone().unwrap_or_else(|| "tool failed".into())})
            });
            tool_results.push(ContentBlock::ToolResult(ToolResultBlock::new(call.call_id.to_string(), value)));
        }

        {
            let mut messages = self.messages.lock().await;
            messages.push(Message::user_with_blocks(tool_results));
        }
        self.save_messages().await?;
        self.notify_messages_changed().await?;

        let records: Vec<_> = dispatched.into_iter().map(|d| d.record).collect();
        self.store.save_tool_records(&self.agent_id, &records).await?;

        Ok(())
    }

    async fn save_messages(&self) -> Result<()> {
        let messages = self.messages.lock().await.clone();
        self.store.save_messages(&self.agent_id, &messages).await
    }

    /// Marks the current point as a Safe-Fork-Point: a message-boundary where
    /// a snapshot may be taken without splitting a tool call mid-flight.
    async fn mark_sfp(&self) -> Result<()> {
        let index = self.messages.lock().await.len();
        *self.last_sfp_index.lock().await = index;
        self.persist_info(self.current_breakpoint().await).await
    }

    /// Captures a `Snapshot` at the last recorded Safe-Fork-Point.
    pub async fn snapshot(&self, label: Option<String>) -> Result<crate::model::Snapshot> {
        if !self.current_breakpoint().await.is_crash_resting_point() {
            return Err(Error::snapshot("snapshot attempted outside a Safe-Fork-Point"));
        }
        let sfp_index = *self.last_sfp_index.lock().await;
        let messages = self.messages.lock().await[..sfp_index.min(self.messages.lock().await.len())].to_vec();
        let tool_records = self.store.load_tool_records(&self.agent_id).await?;
        Ok(crate::model::Snapshot {
            id: crate::ids::SnapshotId::generate(),
            agent_id: self.agent_id.clone(),
            label,
            messages,
            tool_records,
            sfp_index,
            last_bookmark: None,
            created_at: chrono::Utc::now(),
        })
    }

    pub fn set_watcher(&self, watcher: FileWatcher) {
        if let Ok(mut guard) = self.watcher.try_lock() {
            *guard = Some(watcher);
        }
    }
}
