//! The `task_run` meta-tool: lets an agent spawn and drive a bounded-depth
//! subagent through the same `AgentPool` it itself lives in (spec §4.10,
//! §9 Open Questions).
//!
//! `task_run` is an ordinary [`Tool`](crate::tools::Tool) — the dispatcher,
//! permission gate, and hook points all treat it exactly like any other tool
//! call, which is how the teacher's tool system expects recursion to work
//! (a tool is just a function; nothing stops a function from calling back
//! into the agent machinery it's embedded in).
//!
//! Depth is threaded without a `ToolContext`: since `ToolHandler` only ever
//! receives the call's JSON arguments, each depth level gets its own
//! `task_run` instance, built fresh by [`AgentTemplate::build_options`] with
//! the next depth baked into its closure. A template registered at depth `d`
//! only receives a `task_run` tool in its own option set when `d + 1` is still
//! under `SubagentConfig::depth` — past that, the child simply has no
//! `task_run` tool to call, which is a natural, enforced depth limit rather
//! than a runtime check sprinkled through the handler.

use crate::agent_loop::QueuedMessage;
use crate::ids::AgentId;
use crate::pool::{AgentPool, PoolConfig};
use crate::tools::{tool, Tool};
use crate::types::{AgentOptionsBuilder, ContentBlock, SubagentConfig};
use crate::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// How one named template builds the `AgentOptionsBuilder` a subagent of
/// that kind should start from, before `task_run` is appended (or withheld,
/// at the depth limit).
pub type TemplateBuilderFn = Arc<dyn Fn() -> AgentOptionsBuilder + Send + Sync>;

/// One entry in a [`TemplateRegistry`].
#[derive(Clone)]
pub struct AgentTemplate {
    pub id: String,
    pub version: String,
    pub builder: TemplateBuilderFn,
}

impl AgentTemplate {
    pub fn new(id: impl Into<String>, version: impl Into<String>, builder: TemplateBuilderFn) -> Self {
        Self { id: id.into(), version: version.into(), builder }
    }

    /// Builds this template's options for an agent living at `depth`,
    /// appending a `task_run` tool (capturing `depth + 1`) only when the
    /// subagent config still allows a level below this one.
    fn build_options(&self, pool: Arc<AgentPool>, registry: Arc<TemplateRegistry>, config: SubagentConfig, depth: u32) -> Result<crate::types::AgentOptions> {
        let mut builder = (self.builder)();
        if depth + 1 < config.depth {
            builder = builder.tool(task_run(pool, registry, config, depth + 1));
        }
        builder.build()
    }
}

/// A named set of subagent templates `task_run` is allowed to spawn.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, AgentTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self { templates: HashMap::new() }
    }

    pub fn register(&mut self, template: AgentTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&AgentTemplate> {
        self.templates.get(id)
    }
}

/// Builds the `task_run` tool for an agent living at `depth`. `config`
/// carries the template allow-list and the max depth (spec's
/// `SubagentConfig`); `pool` is the pool the new subagent is created in and
/// destroyed from once it finishes.
pub fn task_run(pool: Arc<AgentPool>, registry: Arc<TemplateRegistry>, config: SubagentConfig, depth: u32) -> Tool {
    tool(
        "task_run",
        "Runs a subagent from a named template to completion and returns its final answer.",
    )
    .schema(json!({
        "type": "object",
        "properties": {
            "template": {"type": "string", "description": "Registered subagent template id"},
            "prompt": {"type": "string", "description": "Task to give the subagent"},
        },
        "required": ["template", "prompt"],
    }))
    .build(move |args| {
        let pool = pool.clone();
        let registry = registry.clone();
        let config = config.clone();
        async move { run_task(pool, registry, config, depth, args).await }
    })
    .no_effect(false)
    .readonly(false)
}

async fn run_task(pool: Arc<AgentPool>, registry: Arc<TemplateRegistry>, config: SubagentConfig, depth: u32, args: Value) -> Result<Value> {
    let template_id = args
        .get("template")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_input("task_run requires a 'template' string argument"))?;
    let prompt = args
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_input("task_run requires a 'prompt' string argument"))?;

    if !config.templates.iter().any(|t| t == template_id) {
        return Err(Error::invalid_input(format!("template '{template_id}' is not in this agent's allowed subagent templates")));
    }
    let template = registry
        .get(template_id)
        .ok_or_else(|| Error::invalid_input(format!("no such registered template '{template_id}'")))?
        .clone();

    let options = template.build_options(pool.clone(), registry.clone(), config, depth)?;
    let child_id = AgentId::generate();
    let agent = pool
        .create(
            child_id.clone(),
            PoolConfig { options, template_id: template.id.clone(), template_version: template.version.clone() },
        )
        .await?;

    agent.enqueue(QueuedMessage::User(prompt.to_string()));
    agent.step().await?;

    let history = agent.history().await;
    let output = history
        .iter()
        .rev()
        .find(|m| matches!(m.role, crate::types::MessageRole::Assistant))
        .map(final_text)
        .unwrap_or_default();

    pool.destroy(&child_id).await?;

    Ok(json!({"agent_id": child_id.as_str(), "output": output}))
}

fn final_text(message: &crate::types::Message) -> String {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
