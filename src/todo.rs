//! Agent-visible to-do list (spec §4.9).
//!
//! `TodoManager` is the durable, event-emitting counterpart to `model::TodoItem`:
//! every mutation is persisted through a `Store` and announced on the `monitor`
//! channel as `todo_changed`, and a step-based ticker periodically reminds the
//! agent loop to look at open items via `todo_reminder`. Grounded on the
//! `HookManager`'s "registry of small pieces of mutable state behind a lock"
//! shape, generalized from handlers to to-do rows.

use crate::ids::AgentId;
use crate::model::{TodoItem, TodoStatus};
use crate::store::Store;
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Configuration for one agent's to-do reminders.
#[derive(Debug, Clone)]
pub struct TodoConfig {
    pub enabled: bool,
    /// Remind every N agent-loop steps; `None` disables step-based reminders.
    pub remind_interval_steps: Option<u32>,
    pub reminder_on_start: bool,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remind_interval_steps: Some(10),
            reminder_on_start: false,
        }
    }
}

/// What a mutation emits for `monitor`-channel consumption. The `AgentLoop`
/// wraps these in an `EventEnvelope` via `EventBus::publish`.
#[derive(Debug, Clone)]
pub enum TodoEvent {
    Changed { todos: Vec<TodoItem> },
    Reminder { open_count: usize },
}

/// Owns and persists one agent's to-do list.
pub struct TodoManager {
    agent_id: AgentId,
    store: Arc<dyn Store>,
    config: TodoConfig,
    todos: Mutex<Vec<TodoItem>>,
    steps_since_reminder: Mutex<u32>,
}

impl TodoManager {
    pub fn new(agent_id: AgentId, store: Arc<dyn Store>, config: TodoConfig) -> Self {
        Self {
            agent_id,
            store,
            config,
            todos: Mutex::new(Vec::new()),
            steps_since_reminder: Mutex::new(0),
        }
    }

    /// Loads persisted to-dos into memory; call once when an agent resumes.
    pub async fn hydrate(&self) -> Result<()> {
        let todos = self.store.load_todos(&self.agent_id).await?;
        *self.todos.lock() = todos;
        Ok(())
    }

    pub fn get_todos(&self) -> Vec<TodoItem> {
        self.todos.lock().clone()
    }

    pub async fn set_todos(&self, todos: Vec<TodoItem>) -> Result<TodoEvent> {
        *self.todos.lock() = todos.clone();
        self.store.save_todos(&self.agent_id, &todos).await?;
        Ok(TodoEvent::Changed { todos })
    }

    pub async fn add_todo(&self, id: impl Into<String>, title: impl Into<String>) -> Result<TodoEvent> {
        let now = Utc::now();
        let item = TodoItem {
            id: id.into(),
            title: title.into(),
            status: TodoStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let todos = {
            let mut guard = self.todos.lock();
            guard.push(item);
            guard.clone()
        };
        self.store.save_todos(&self.agent_id, &todos).await?;
        Ok(TodoEvent::Changed { todos })
    }

    pub async fn update_todo(&self, id: &str, status: TodoStatus) -> Result<TodoEvent> {
        let todos = {
            let mut guard = self.todos.lock();
            let item = guard
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| Error::other(format!("no such todo: {id}")))?;
            item.status = status;
            item.updated_at = Utc::now();
            guard.clone()
        };
        self.store.save_todos(&self.agent_id, &todos).await?;
        Ok(TodoEvent::Changed { todos })
    }

    pub async fn delete_todo(&self, id: &str) -> Result<TodoEvent> {
        let todos = {
            let mut guard = self.todos.lock();
            guard.retain(|t| t.id != id);
            guard.clone()
        };
        self.store.save_todos(&self.agent_id, &todos).await?;
        Ok(TodoEvent::Changed { todos })
    }

    /// Advances the step counter by one; returns a reminder event if the
    /// configured interval has elapsed and there are open items to remind about.
    pub fn tick_step(&self) -> Option<TodoEvent> {
        let Some(interval) = self.config.remind_interval_steps else {
            return None;
        };
        if !self.config.enabled || interval == 0 {
            return None;
        }
        let mut steps = self.steps_since_reminder.lock();
        *steps += 1;
        if *steps < interval {
            return None;
        }
        *steps = 0;
        let open_count = self
            .todos
            .lock()
            .iter()
            .filter(|t| !matches!(t.status, TodoStatus::Completed | TodoStatus::Cancelled))
            .count();
        if open_count == 0 {
            return None;
        }
        Some(TodoEvent::Reminder { open_count })
    }
}
