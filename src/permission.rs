//! Tool-call permission evaluation and approval bookkeeping (spec §4.3).
//!
//! `PermissionManager` decides, for each tool call, whether it runs immediately,
//! is denied outright, or must wait on a human/policy decision delivered through
//! the control channel. Evaluation order is fixed: `deny_tools` beats
//! `allow_tools` beats `require_approval_tools` beats the ambient `mode`.

use crate::ids::CallId;
use crate::model::PermissionDecision;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// How the manager treats a call that isn't named in any of the three lists.
#[derive(Debug, Clone)]
pub enum PermissionMode {
    /// Every call runs immediately.
    Auto,
    /// Every call waits for an explicit decision.
    Approval,
    /// Only tools marked `readonly`/`no_effect` on their `Tool` definition run;
    /// everything else is denied. Evaluated by the caller, which must pass the
    /// tool's `readonly`/`no_effect` flags into `evaluate`.
    Readonly,
    /// A caller-supplied closure makes the call.
    Custom(CustomModeFn),
}

pub type CustomModeFn = Arc<
    dyn Fn(&str, &serde_json::Value) -> Pin<Box<dyn Future<Output = Verdict> + Send>> + Send + Sync,
>;

impl std::fmt::Debug for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Auto => write!(f, "Auto"),
            PermissionMode::Approval => write!(f, "Approval"),
            PermissionMode::Readonly => write!(f, "Readonly"),
            PermissionMode::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// The outcome of evaluating one tool call against the permission configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    RequireApproval,
}

/// Declarative permission configuration (spec §4.3, §6).
#[derive(Debug, Clone, Default)]
pub struct PermissionConfig {
    pub mode: Option<PermissionModeKind>,
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
    pub require_approval_tools: Vec<String>,
}

/// Serializable tag for the ambient mode; `Custom` closures live outside config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionModeKind {
    #[default]
    Auto,
    Approval,
    Readonly,
}

struct PendingApproval {
    tool_name: String,
    input: serde_json::Value,
    tx: tokio::sync::oneshot::Sender<ResolvedApproval>,
}

/// What a caller supplies when resolving a pending approval.
#[derive(Debug, Clone)]
pub struct ResolvedApproval {
    pub decision: PermissionDecision,
    pub decider: Option<String>,
    pub note: Option<String>,
}

/// Evaluates and tracks tool-call permissions for one agent.
pub struct PermissionManager {
    mode: PermissionMode,
    allow_tools: Vec<String>,
    deny_tools: Vec<String>,
    require_approval_tools: Vec<String>,
    pending: Mutex<HashMap<CallId, PendingApproval>>,
}

impl PermissionManager {
    pub fn new(config: PermissionConfig) -> Self {
        let mode = match config.mode.unwrap_or_default() {
            PermissionModeKind::Auto => PermissionMode::Auto,
            PermissionModeKind::Approval => PermissionMode::Approval,
            PermissionModeKind::Readonly => PermissionMode::Readonly,
        };
        Self {
            mode,
            allow_tools: config.allow_tools,
            deny_tools: config.deny_tools,
            require_approval_tools: config.require_approval_tools,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_custom_mode(mut self, f: CustomModeFn) -> Self {
        self.mode = PermissionMode::Custom(f);
        self
    }

    /// Evaluates one call. `tool_is_side_effect_free` is consulted only under
    /// `Readonly` mode.
    pub async fn evaluate(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        tool_is_side_effect_free: bool,
    ) -> Verdict {
        if self.deny_tools.iter().any(|t| t == tool_name) {
            return Verdict::Deny;
        }
        if self.allow_tools.iter().any(|t| t == tool_name) {
            return Verdict::Allow;
        }
        if self.require_approval_tools.iter().any(|t| t == tool_name) {
            return Verdict::RequireApproval;
        }
        match &self.mode {
            PermissionMode::Auto => Verdict::Allow,
            PermissionMode::Approval => Verdict::RequireApproval,
            PermissionMode::Readonly => {
                if tool_is_side_effect_free {
                    Verdict::Allow
                } else {
                    Verdict::Deny
                }
            }
            PermissionMode::Custom(f) => f(tool_name, input).await,
        }
    }

    /// Registers a call awaiting approval and returns the receiver its eventual
    /// resolution will arrive on.
    pub fn await_approval(
        &self,
        call_id: CallId,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> tokio::sync::oneshot::Receiver<ResolvedApproval> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().insert(
            call_id,
            PendingApproval {
                tool_name: tool_name.into(),
                input,
                tx,
            },
        );
        rx
    }

    /// Resolves a pending approval. Errors if `call_id` has no pending entry —
    /// callers should treat that as "already decided or never requested."
    pub fn decide(
        &self,
        call_id: &CallId,
        decision: PermissionDecision,
        decider: Option<String>,
        note: Option<String>,
    ) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .remove(call_id)
            .ok_or_else(|| Error::permission(format!("no pending approval for {call_id}")))?;
        pending
            .tx
            .send(ResolvedApproval { decision, decider, note })
            .map_err(|_| Error::permission("approval receiver dropped before decision delivered"))
    }

    pub fn pending_call_ids(&self) -> Vec<CallId> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn pending_info(&self, call_id: &CallId) -> Option<(String, serde_json::Value)> {
        self.pending
            .lock()
            .get(call_id)
            .map(|p| (p.tool_name.clone(), p.input.clone()))
    }
}
