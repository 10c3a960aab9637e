//! Persistence protocol (spec §4.1).
//!
//! `Store` is the kernel's sole durability seam: everything an `AgentLoop` needs to
//! survive a crash flows through it. Two implementations ship in this crate —
//! [`FileStore`], a write-ahead-logged JSON tree on disk, and [`InMemoryStore`], a
//! `parking_lot`-guarded map used by tests and the bundled examples.

use crate::ids::AgentId;
use crate::model::{AgentInfo, Bookmark, Channel, EventEnvelope, Snapshot, ToolCallRecord, TodoItem};
use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Diagnostic returned by [`Store::health_check`].
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub reachable: bool,
    pub distributed_lock: LockKind,
    pub detail: String,
}

/// Whether `acquire_agent_lock` actually excludes other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Safe across processes and machines.
    Distributed,
    /// Only excludes other tasks within this process — see spec §9 Open Questions.
    PerProcessOnly,
}

/// A held agent lock; dropping or calling `release` relinquishes it.
pub struct AgentLockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AgentLockGuard {
    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for AgentLockGuard {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

/// Abstract durable storage for one kernel deployment (spec §4.1).
///
/// Every method is keyed by `AgentId` except the pool-wide metadata accessors.
/// Implementations must make each individual write atomic: callers never observe
/// a partially-written map.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<()>;
    async fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>>;

    async fn save_tool_records(&self, agent: &AgentId, records: &[ToolCallRecord]) -> Result<()>;
    async fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>>;

    async fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<()>;
    async fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>>;

    async fn append_event(&self, event: EventEnvelope) -> Result<()>;
    /// Returns events for `agent` with cursor strictly greater than `since`'s cursor
    /// (or all events if `since` is `None`), filtered to `channels` when non-empty.
    async fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: &[Channel],
    ) -> Result<Vec<EventEnvelope>>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn load_snapshot(&self, agent: &AgentId, snapshot_id: &str) -> Result<Option<Snapshot>>;
    async fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<Snapshot>>;

    async fn save_info(&self, info: &AgentInfo) -> Result<()>;
    async fn load_info(&self, agent: &AgentId) -> Result<Option<AgentInfo>>;

    async fn exists(&self, agent: &AgentId) -> Result<bool>;
    async fn delete(&self, agent: &AgentId) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<AgentId>>;

    /// Saves the pool's list of agent ids that were live at graceful shutdown.
    async fn save_pool_running_list(&self, ids: &[AgentId]) -> Result<()>;
    async fn load_pool_running_list(&self) -> Result<Vec<AgentId>>;

    /// Advisory lock over one agent id. `PerProcessOnly` implementations must say
    /// so via `health_check` rather than silently under-promising.
    async fn acquire_agent_lock(&self, agent: &AgentId) -> Result<AgentLockGuard>;

    async fn health_check(&self) -> Result<HealthReport>;
}

// ============================================================================
// InMemoryStore — test/example double
// ============================================================================

#[derive(Default)]
struct InMemoryTables {
    messages: HashMap<AgentId, Vec<Message>>,
    tool_records: HashMap<AgentId, Vec<ToolCallRecord>>,
    todos: HashMap<AgentId, Vec<TodoItem>>,
    events: HashMap<AgentId, Vec<EventEnvelope>>,
    snapshots: HashMap<AgentId, Vec<Snapshot>>,
    info: HashMap<AgentId, AgentInfo>,
    pool_running: Vec<AgentId>,
    locks: std::collections::HashSet<AgentId>,
}

/// An in-process `Store` backed by a single mutex-guarded set of maps.
///
/// Grounded on the teacher's preference for small, explicit test doubles
/// (see `hooks.rs`'s hand-written handler closures) rather than a mocking crate.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<InMemoryTables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<()> {
        self.tables
            .lock()
            .messages
            .insert(agent.clone(), messages.to_vec());
        Ok(())
    }

    async fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>> {
        Ok(self
            .tables
            .lock()
            .messages
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_tool_records(&self, agent: &AgentId, records: &[ToolCallRecord]) -> Result<()> {
        self.tables
            .lock()
            .tool_records
            .insert(agent.clone(), records.to_vec());
        Ok(())
    }

    async fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>> {
        Ok(self
            .tables
            .lock()
            .tool_records
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<()> {
        self.tables.lock().todos.insert(agent.clone(), todos.to_vec());
        Ok(())
    }

    async fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>> {
        Ok(self.tables.lock().todos.get(agent).cloned().unwrap_or_default())
    }

    async fn append_event(&self, event: EventEnvelope) -> Result<()> {
        self.tables
            .lock()
            .events
            .entry(event.agent_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: &[Channel],
    ) -> Result<Vec<EventEnvelope>> {
        let tables = self.tables.lock();
        let events = tables.events.get(agent).cloned().unwrap_or_default();
        Ok(events
            .into_iter()
            .filter(|e| since.is_none_or(|s| e.bookmark > s))
            .filter(|e| channels.is_empty() || channels.contains(&e.channel))
            .collect())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tables = self.tables.lock();
        let list = tables.snapshots.entry(snapshot.agent_id.clone()).or_default();
        list.retain(|s| s.id != snapshot.id);
        list.push(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, agent: &AgentId, snapshot_id: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .tables
            .lock()
            .snapshots
            .get(agent)
            .and_then(|list| list.iter().find(|s| s.id.as_str() == snapshot_id).cloned()))
    }

    async fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<Snapshot>> {
        Ok(self
            .tables
            .lock()
            .snapshots
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        self.tables.lock().info.insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn load_info(&self, agent: &AgentId) -> Result<Option<AgentInfo>> {
        Ok(self.tables.lock().info.get(agent).cloned())
    }

    async fn exists(&self, agent: &AgentId) -> Result<bool> {
        Ok(self.tables.lock().info.contains_key(agent))
    }

    async fn delete(&self, agent: &AgentId) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.messages.remove(agent);
        tables.tool_records.remove(agent);
        tables.todos.remove(agent);
        tables.events.remove(agent);
        tables.snapshots.remove(agent);
        tables.info.remove(agent);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<AgentId>> {
        Ok(self
            .tables
            .lock()
            .info
            .keys()
            .filter(|id| id.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn save_pool_running_list(&self, ids: &[AgentId]) -> Result<()> {
        self.tables.lock().pool_running = ids.to_vec();
        Ok(())
    }

    async fn load_pool_running_list(&self) -> Result<Vec<AgentId>> {
        Ok(self.tables.lock().pool_running.clone())
    }

    async fn acquire_agent_lock(&self, agent: &AgentId) -> Result<AgentLockGuard> {
        let mut tables = self.tables.lock();
        if !tables.locks.insert(agent.clone()) {
            return Err(Error::store(format!("agent {agent} already locked")));
        }
        let tables_handle = self.tables.clone();
        let agent = agent.clone();
        Ok(AgentLockGuard {
            release: Some(Box::new(move || {
                tables_handle.lock().locks.remove(&agent);
            })),
        })
    }

    async fn health_check(&self) -> Result<HealthReport> {
        Ok(HealthReport {
            reachable: true,
            distributed_lock: LockKind::PerProcessOnly,
            detail: "in-memory store, single process only".into(),
        })
    }
}

// ============================================================================
// FileStore — write-ahead-logged JSON tree on disk
// ============================================================================

/// A `Store` backed by one JSON file per named map under `<root>/<agent_id>/`,
/// written via a `.wal` staging file that is fsynced then renamed over the target.
///
/// Grounded on the crash-safety contract of spec §4.1: a write either lands
/// completely (rename succeeds) or is as if it never started (crash before
/// rename, the old `<name>.json` is untouched).
pub struct FileStore {
    root: PathBuf,
    locks: Arc<dashmap::DashMap<AgentId, ()>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(dashmap::DashMap::new()),
        }
    }

    fn agent_dir(&self, agent: &AgentId) -> PathBuf {
        self.root.join(agent.as_str())
    }

    fn pool_meta_path(&self) -> PathBuf {
        self.root.join("__pool_meta__.json")
    }

    async fn write_json<T: serde::Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store(format!("create_dir_all {}: {e}", parent.display())))?;
        }
        let wal_path = path.with_extension("wal");
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut file = tokio::fs::File::create(&wal_path)
            .await
            .map_err(|e| Error::store(format!("create {}: {e}", wal_path.display())))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::store(format!("write {}: {e}", wal_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| Error::store(format!("fsync {}: {e}", wal_path.display())))?;
        tokio::fs::rename(&wal_path, path)
            .await
            .map_err(|e| Error::store(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned + Default>(&self, path: &Path) -> Result<T> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(Error::store(format!("read {}: {e}", path.display()))),
        }
    }

    async fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store(format!("create_dir_all {}: {e}", parent.display())))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::store(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::store(format!("append {}: {e}", path.display())))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| Error::store(format!("append {}: {e}", path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| Error::store(format!("fsync {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn save_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<()> {
        let path = self.agent_dir(agent).join("messages.json");
        self.write_json(&path, &messages.to_vec()).await
    }

    async fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>> {
        self.read_json(&self.agent_dir(agent).join("messages.json")).await
    }

    async fn save_tool_records(&self, agent: &AgentId, records: &[ToolCallRecord]) -> Result<()> {
        let path = self.agent_dir(agent).join("tool_call_records.json");
        self.write_json(&path, &records.to_vec()).await
    }

    async fn load_tool_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>> {
        self.read_json(&self.agent_dir(agent).join("tool_call_records.json"))
            .await
    }

    async fn save_todos(&self, agent: &AgentId, todos: &[TodoItem]) -> Result<()> {
        let path = self.agent_dir(agent).join("todos.json");
        self.write_json(&path, &todos.to_vec()).await
    }

    async fn load_todos(&self, agent: &AgentId) -> Result<Vec<TodoItem>> {
        self.read_json(&self.agent_dir(agent).join("todos.json")).await
    }

    async fn append_event(&self, event: EventEnvelope) -> Result<()> {
        let path = self.agent_dir(&event.agent_id).join("events.jsonl");
        let line = serde_json::to_string(&event)?;
        self.append_line(&path, &line).await
    }

    async fn read_events(
        &self,
        agent: &AgentId,
        since: Option<Bookmark>,
        channels: &[Channel],
    ) -> Result<Vec<EventEnvelope>> {
        let path = self.agent_dir(agent).join("events.jsonl");
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("read {}: {e}", path.display()))),
        };
        let mut out = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: EventEnvelope = serde_json::from_str(line)?;
            if since.is_some_and(|s| event.bookmark <= s) {
                continue;
            }
            if !channels.is_empty() && !channels.contains(&event.channel) {
                continue;
            }
            out.push(event);
        }
        Ok(out)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self
            .agent_dir(&snapshot.agent_id)
            .join("snapshots")
            .join(format!("{}.json", snapshot.id));
        self.write_json(&path, snapshot).await
    }

    async fn load_snapshot(&self, agent: &AgentId, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let path = self
            .agent_dir(agent)
            .join("snapshots")
            .join(format!("{snapshot_id}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(format!("read {}: {e}", path.display()))),
        }
    }

    async fn list_snapshots(&self, agent: &AgentId) -> Result<Vec<Snapshot>> {
        let dir = self.agent_dir(agent).join("snapshots");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("read_dir {}: {e}", dir.display()))),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store(format!("read_dir entry: {e}")))?
        {
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| Error::store(format!("read {}: {e}", entry.path().display())))?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        let path = self.agent_dir(&info.id).join("info.json");
        self.write_json(&path, info).await
    }

    async fn load_info(&self, agent: &AgentId) -> Result<Option<AgentInfo>> {
        let path = self.agent_dir(agent).join("info.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(format!("read {}: {e}", path.display()))),
        }
    }

    async fn exists(&self, agent: &AgentId) -> Result<bool> {
        Ok(self.agent_dir(agent).join("info.json").exists())
    }

    async fn delete(&self, agent: &AgentId) -> Result<()> {
        let dir = self.agent_dir(agent);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store(format!("remove_dir_all {}: {e}", dir.display()))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<AgentId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("read_dir {}: {e}", self.root.display()))),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store(format!("read_dir entry: {e}")))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && name != "__pool_meta__.json" {
                    out.push(AgentId::from_existing(name)?);
                }
            }
        }
        Ok(out)
    }

    async fn save_pool_running_list(&self, ids: &[AgentId]) -> Result<()> {
        self.write_json(&self.pool_meta_path(), &ids.to_vec()).await
    }

    async fn load_pool_running_list(&self) -> Result<Vec<AgentId>> {
        self.read_json(&self.pool_meta_path()).await
    }

    async fn acquire_agent_lock(&self, agent: &AgentId) -> Result<AgentLockGuard> {
        if self.locks.insert(agent.clone(), ()).is_some() {
            return Err(Error::store(format!("agent {agent} already locked")));
        }
        let locks = self.locks.clone();
        let agent = agent.clone();
        Ok(AgentLockGuard {
            release: Some(Box::new(move || {
                locks.remove(&agent);
            })),
        })
    }

    async fn health_check(&self) -> Result<HealthReport> {
        let reachable = tokio::fs::metadata(&self.root).await.is_ok()
            || tokio::fs::create_dir_all(&self.root).await.is_ok();
        Ok(HealthReport {
            reachable,
            distributed_lock: LockKind::PerProcessOnly,
            detail: format!(
                "file store at {} uses a per-process lock table, not a cross-process mutex",
                self.root.display()
            ),
        })
    }
}
