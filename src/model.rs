//! Persisted data model shared between the `Store`, `EventBus`, and `AgentLoop`.
//!
//! These types are the kernel's analogue of the teacher's OpenAI wire types
//! (`types.rs`): where those describe what goes over HTTP, these describe what
//! goes into durable storage.

use crate::ids::{AgentId, CallId, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The eight-state execution phase of one agent (spec §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Breakpoint {
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

impl Breakpoint {
    /// States where a crashed process may legitimately rest.
    pub fn is_crash_resting_point(self) -> bool {
        matches!(self, Breakpoint::Ready | Breakpoint::AwaitingApproval)
    }

    /// States mid-tool-lifecycle, subject to auto-seal on crash recovery (spec §7).
    pub fn is_mid_tool(self) -> bool {
        matches!(
            self,
            Breakpoint::ToolPending
                | Breakpoint::PreTool
                | Breakpoint::ToolExecuting
                | Breakpoint::PostTool
        )
    }
}

/// One state in a `ToolCallRecord`'s lifecycle (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallState {
    Pending,
    ApprovalRequired,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
    Sealed,
}

/// Classification of a tool failure (spec §4.5 item 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorType {
    Validation,
    Runtime,
    Logical,
    Aborted,
    Exception,
}

impl ToolErrorType {
    /// Whether the model may reasonably retry the call that produced this error.
    pub fn retryable(self) -> bool {
        !matches!(self, ToolErrorType::Validation | ToolErrorType::Aborted)
    }
}

/// One audit-trail entry appended on every `ToolCallRecord` state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub state: ToolCallState,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
}

/// The approval sub-record of a `ToolCallRecord` (spec §3, §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub required: bool,
    pub decision: Option<PermissionDecision>,
    pub decider: Option<String>,
    pub note: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A human or policy's decision on a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// One model-requested tool invocation and its full lifecycle (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: CallId,
    pub tool_name: String,
    pub input: Value,
    pub state: ToolCallState,
    pub approval: ApprovalRecord,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<ToolErrorType>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audit: Vec<AuditEntry>,
}

impl ToolCallRecord {
    pub fn new(id: CallId, tool_name: impl Into<String>, input: Value) -> Self {
        let mut record = Self {
            id,
            tool_name: tool_name.into(),
            input,
            state: ToolCallState::Pending,
            approval: ApprovalRecord::default(),
            result: None,
            error: None,
            error_type: None,
            started_at: None,
            ended_at: None,
            audit: Vec::new(),
        };
        record.push_audit(None);
        record
    }

    fn push_audit(&mut self, note: Option<String>) {
        self.audit.push(AuditEntry {
            state: self.state,
            timestamp: Utc::now(),
            note,
        });
    }

    /// Transitions state and appends an audit entry. Callers are responsible for
    /// checking the transition is legal per the graph in spec §3 — this method only
    /// records the fact of the transition.
    pub fn transition(&mut self, next: ToolCallState, note: Option<String>) {
        self.state = next;
        self.push_audit(note);
    }
}

/// A single to-do tracked by `TodoManager` (spec §4.9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Which of the three event streams an event belongs to (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

/// Position in an agent's event log (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bookmark {
    pub seq: u64,
    pub timestamp_millis: i64,
}

/// A fully addressed event as it lives in the log and travels to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub agent_id: AgentId,
    pub cursor: u64,
    pub bookmark: Bookmark,
    pub channel: Channel,
    pub payload: Value,
}

/// Durable per-agent metadata (spec §3 "AgentInfo").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub template_id: String,
    pub template_version: String,
    pub created_at: DateTime<Utc>,
    pub lineage: Vec<AgentId>,
    pub config_version_hash: String,
    pub message_count: usize,
    pub last_sfp_index: usize,
    pub last_bookmark: Option<Bookmark>,
    pub breakpoint: Breakpoint,
    pub metadata: HashMap<String, Value>,
}

impl AgentInfo {
    pub fn new(id: AgentId, template_id: impl Into<String>, template_version: impl Into<String>) -> Self {
        Self {
            id,
            template_id: template_id.into(),
            template_version: template_version.into(),
            created_at: Utc::now(),
            lineage: Vec::new(),
            config_version_hash: String::new(),
            message_count: 0,
            last_sfp_index: 0,
            last_bookmark: None,
            breakpoint: Breakpoint::Ready,
            metadata: HashMap::new(),
        }
    }
}

/// A captured agent state at a Safe-Fork-Point (spec §3, §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub agent_id: AgentId,
    pub label: Option<String>,
    pub messages: Vec<crate::types::Message>,
    pub tool_records: Vec<ToolCallRecord>,
    pub sfp_index: usize,
    pub last_bookmark: Option<Bookmark>,
    pub created_at: DateTime<Utc>,
}
