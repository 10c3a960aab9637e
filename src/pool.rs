//! Concurrent registry of running agents plus graceful shutdown/resume (spec §4.10).
//!
//! `AgentPool` is the one place that owns every live `AgentLoop` in a process.
//! It refuses to construct two live agents for the same `AgentId`, acquires the
//! `Store`'s distributed lock so a second process can't either, and is the only
//! thing that knows how to fork a snapshot into a brand-new agent or save the
//! running-ids list so a restart can pick every live agent back up.
//!
//! Grounded on `dashmap`'s existing role in this crate (`events.rs`'s per-agent
//! bus map) for the live-agent map itself, and on the teacher's `interrupted:
//! Arc<AtomicBool>` pattern (`client.rs`, carried into `agent_loop.rs`) for how
//! graceful shutdown waits for a turn to finish before forcing it.

use crate::agent_loop::AgentLoop;
use crate::events::EventBus;
use crate::ids::{AgentId, CallId, SnapshotId};
use crate::model::{AgentInfo, Breakpoint, ToolCallRecord};
use crate::provider::ModelProvider;
use crate::store::Store;
use crate::types::{AgentOptions, ContentBlock};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to construct one agent's `AgentLoop`, plus the template
/// identity recorded in its `AgentInfo`.
pub struct PoolConfig {
    pub options: AgentOptions,
    pub template_id: String,
    pub template_version: String,
}

/// Knobs for `AgentPool::resume` beyond the saved `AgentInfo` itself.
#[derive(Debug, Clone, Default)]
pub struct ResumeOpts {
    pub overrides: Option<serde_json::Value>,
}

/// Knobs for `AgentPool::graceful_shutdown` (spec §4.10).
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    pub timeout: Duration,
    pub force_interrupt: bool,
    pub save_running_list: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), force_interrupt: true, save_running_list: true }
    }
}

/// What happened to each live agent during a `graceful_shutdown`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub completed: Vec<AgentId>,
    pub interrupted: Vec<AgentId>,
    pub failed: Vec<AgentId>,
}

struct AgentHandle {
    agent: Arc<AgentLoop>,
    // Held for the handle's lifetime; released (and the process-local lock
    // table entry dropped) when the handle is removed from `live`.
    _lock: Option<crate::store::AgentLockGuard>,
}

/// Owns every live agent in this process (spec §4.10).
pub struct AgentPool {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    provider: Arc<dyn ModelProvider>,
    max_concurrency: usize,
    live: DashMap<AgentId, AgentHandle>,
}

impl AgentPool {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, provider: Arc<dyn ModelProvider>, max_concurrency: usize) -> Self {
        Self {
            store,
            events,
            provider,
            max_concurrency: max_concurrency.max(1),
            live: DashMap::new(),
        }
    }

    /// Returns a clone of the live `AgentLoop` handle for `id`, if running.
    pub fn agent(&self, id: &AgentId) -> Option<Arc<AgentLoop>> {
        self.live.get(id).map(|h| h.agent.clone())
    }

    pub fn live_ids(&self) -> Vec<AgentId> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn build_loop(&self, id: AgentId, options: AgentOptions) -> Arc<AgentLoop> {
        Arc::new(AgentLoop::new(id, self.store.clone(), self.events.clone(), self.provider.clone(), options))
    }

    /// Creates a brand-new agent. Refuses if `id` already has persisted state
    /// in the `Store` (spec §4.10 "refuse if id exists in Store").
    pub async fn create(&self, id: AgentId, config: PoolConfig) -> Result<Arc<AgentLoop>> {
        if self.store.exists(&id).await? {
            return Err(Error::pool(format!("agent {id} already exists in store")));
        }
        if self.live.len() >= self.max_concurrency {
            return Err(Error::pool(format!("pool at max concurrency ({})", self.max_concurrency)));
        }

        let lock = self.store.acquire_agent_lock(&id).await?;
        let info = AgentInfo::new(id.clone(), config.template_id, config.template_version);
        self.store.save_info(&info).await?;

        let agent = self.build_loop(id.clone(), config.options);
        self.live.insert(id, AgentHandle { agent: agent.clone(), _lock: Some(lock) });
        Ok(agent)
    }

    /// Resumes an agent whose state already exists in the `Store`, applying
    /// the crash-resume rules of spec §4.6 via `AgentLoop::resume_from_store`.
    pub async fn resume(&self, id: AgentId, config: PoolConfig, _opts: ResumeOpts) -> Result<Arc<AgentLoop>> {
        if !self.store.exists(&id).await? {
            return Err(Error::pool(format!("no persisted agent {id} to resume")));
        }
        if self.live.contains_key(&id) {
            return Err(Error::pool(format!("agent {id} is already live in this process")));
        }
        if self.live.len() >= self.max_concurrency {
            return Err(Error::pool(format!("pool at max concurrency ({})", self.max_concurrency)));
        }

        let lock = self.store.acquire_agent_lock(&id).await?;
        let agent = self.build_loop(id.clone(), config.options);
        agent.resume_from_store().await?;
        self.live.insert(id, AgentHandle { agent: agent.clone(), _lock: Some(lock) });
        Ok(agent)
    }

    /// Like `resume`, but the caller derives `AgentOptions` from the agent's
    /// own saved metadata (template id/version, lineage) instead of supplying
    /// it directly — the embedder's template registry is the thing that knows
    /// how to turn a `template_id` back into tools/hooks/sandbox.
    pub async fn resume_from_store<F>(&self, id: AgentId, build_options: F, opts: ResumeOpts) -> Result<Arc<AgentLoop>>
    where
        F: FnOnce(&AgentInfo, Option<&serde_json::Value>) -> Result<AgentOptions>,
    {
        let info = self
            .store
            .load_info(&id)
            .await?
            .ok_or_else(|| Error::pool(format!("no metadata for {id}")))?;
        let options = build_options(&info, opts.overrides.as_ref())?;
        self.resume(
            id,
            PoolConfig { options, template_id: info.template_id.clone(), template_version: info.template_version.clone() },
            opts,
        )
        .await
    }

    /// Materializes a new agent from a snapshot (spec §4.12): copies messages
    /// and the tool records the snapshot's messages actually reference, copies
    /// todos, and records lineage. Does not copy the event log.
    pub async fn fork(&self, source: &AgentId, snapshot_id: &str, config: PoolConfig) -> Result<Arc<AgentLoop>> {
        let snapshot = self
            .store
            .load_snapshot(source, snapshot_id)
            .await?
            .ok_or_else(|| Error::snapshot(format!("no snapshot {snapshot_id} for agent {source}")))?;

        let referenced: HashSet<CallId> = snapshot
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::ToolUse(t) => CallId::from_existing(t.id.clone()).ok(),
                ContentBlock::ToolResult(r) => CallId::from_existing(r.tool_use_id.clone()).ok(),
                _ => None,
            })
            .collect();
        let tool_records: Vec<ToolCallRecord> =
            snapshot.tool_records.iter().filter(|r| referenced.contains(&r.id)).cloned().collect();

        let todos = self.store.load_todos(source).await?;
        let parent_info = self.store.load_info(source).await?;

        let new_id = AgentId::generate();
        self.store.save_messages(&new_id, &snapshot.messages).await?;
        self.store.save_tool_records(&new_id, &tool_records).await?;
        self.store.save_todos(&new_id, &todos).await?;

        let mut info = AgentInfo::new(new_id.clone(), config.template_id.clone(), config.template_version.clone());
        info.last_sfp_index = snapshot.sfp_index;
        info.message_count = snapshot.messages.len();
        info.last_bookmark = snapshot.last_bookmark;
        let mut lineage = parent_info.map(|p| p.lineage).unwrap_or_default();
        lineage.push(source.clone());
        info.lineage = lineage;
        self.store.save_info(&info).await?;

        self.create_from_fork(new_id, config).await
    }

    /// Internal: `create` skips the "already exists" check since `fork` has
    /// already written the new agent's initial state.
    async fn create_from_fork(&self, id: AgentId, config: PoolConfig) -> Result<Arc<AgentLoop>> {
        if self.live.len() >= self.max_concurrency {
            return Err(Error::pool(format!("pool at max concurrency ({})", self.max_concurrency)));
        }
        let lock = self.store.acquire_agent_lock(&id).await?;
        let agent = self.build_loop(id.clone(), config.options);
        agent.resume_from_store().await?;
        self.live.insert(id, AgentHandle { agent: agent.clone(), _lock: Some(lock) });
        Ok(agent)
    }

    /// Interrupts, drops the live handle (releasing its `Store` lock), and
    /// removes `id` from the pool. Persisted state is untouched.
    pub async fn destroy(&self, id: &AgentId) -> Result<()> {
        if let Some((_, handle)) = self.live.remove(id) {
            handle.agent.interrupt();
        }
        Ok(())
    }

    /// Waits (bounded by `timeout`) for every live agent to return to `READY`,
    /// force-interrupting stragglers if `force_interrupt` is set, then tears
    /// down the whole pool (spec §4.10).
    pub async fn graceful_shutdown(&self, opts: ShutdownOptions) -> Result<ShutdownReport> {
        let ids = self.live_ids();
        let mut report = ShutdownReport::default();

        for id in &ids {
            let Some(agent) = self.agent(id) else { continue };
            if agent.current_breakpoint().await == Breakpoint::Ready {
                report.completed.push(id.clone());
            } else if tokio::time::timeout(opts.timeout, wait_until_ready(&agent)).await.is_ok() {
                report.completed.push(id.clone());
            } else if opts.force_interrupt {
                agent.interrupt();
                let _ = tokio::time::timeout(Duration::from_millis(200), wait_until_ready(&agent)).await;
                report.interrupted.push(id.clone());
            } else {
                report.failed.push(id.clone());
            }
        }

        if opts.save_running_list {
            self.store.save_pool_running_list(&ids).await?;
        }

        for id in &ids {
            self.destroy(id).await?;
        }

        Ok(report)
    }

    /// Reads back the pool-meta running list and resumes each agent on it,
    /// clearing the list once every resume has been attempted.
    pub async fn resume_from_shutdown<F>(&self, mut build_config: F) -> Result<Vec<AgentId>>
    where
        F: FnMut(&AgentId) -> PoolConfig,
    {
        let ids = self.store.load_pool_running_list().await?;
        let mut resumed = Vec::with_capacity(ids.len());
        for id in ids {
            let config = build_config(&id);
            self.resume(id.clone(), config, ResumeOpts::default()).await?;
            resumed.push(id);
        }
        self.store.save_pool_running_list(&[]).await?;
        Ok(resumed)
    }

    /// Installs OS-signal handlers (SIGTERM on Unix, Ctrl-C everywhere) that
    /// run `graceful_shutdown` once either fires. Spawns a background task;
    /// the returned `JoinHandle` is provided so callers may await it at exit.
    pub fn register_shutdown_handlers(self: Arc<Self>, opts: ShutdownOptions) -> tokio::task::JoinHandle<Result<ShutdownReport>> {
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .map_err(|e| Error::pool(format!("failed to install SIGTERM handler: {e}")))?;
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            self.graceful_shutdown(opts).await
        })
    }
}

async fn wait_until_ready(agent: &AgentLoop) {
    loop {
        if agent.current_breakpoint().await == Breakpoint::Ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelChunk, ModelChunkStream, ModelContext};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    struct SilentProvider;

    #[async_trait]
    impl ModelProvider for SilentProvider {
        async fn stream_complete(&self, _ctx: ModelContext) -> Result<ModelChunkStream> {
            Ok(Box::pin(futures::stream::iter(vec![Ok(ModelChunk::Done { usage: None })])))
        }
    }

    fn test_options() -> AgentOptions {
        AgentOptions::builder().model("m").base_url("http://localhost:1234/v1").build().unwrap()
    }

    fn pool() -> AgentPool {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new(store.clone()));
        AgentPool::new(store, events, Arc::new(SilentProvider), 4)
    }

    #[tokio::test]
    async fn create_refuses_duplicate_id() {
        let pool = pool();
        let id = AgentId::generate();
        pool.create(id.clone(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();
        let err = pool
            .create(id, PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool(_)));
    }

    #[tokio::test]
    async fn resume_refuses_unknown_id() {
        let pool = pool();
        let err = pool
            .resume(AgentId::generate(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() }, ResumeOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool(_)));
    }

    #[tokio::test]
    async fn destroy_removes_from_live_map() {
        let pool = pool();
        let id = AgentId::generate();
        pool.create(id.clone(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
        pool.destroy(&id).await.unwrap();
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_empties_pool_and_saves_running_list() {
        let pool = pool();
        let id = AgentId::generate();
        pool.create(id.clone(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();

        let report = pool.graceful_shutdown(ShutdownOptions::default()).await.unwrap();
        assert_eq!(report.completed, vec![id.clone()]);
        assert!(pool.is_empty());

        let running = pool.store.load_pool_running_list().await.unwrap();
        assert_eq!(running, vec![id]);
    }

    #[tokio::test]
    async fn resume_from_shutdown_resumes_saved_ids() {
        let pool = pool();
        let id = AgentId::generate();
        pool.create(id.clone(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();
        pool.graceful_shutdown(ShutdownOptions::default()).await.unwrap();
        assert!(pool.is_empty());

        let resumed = pool.resume_from_shutdown(|_id| PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() }).await.unwrap();
        assert_eq!(resumed, vec![id]);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn fork_copies_messages_up_to_sfp_and_records_lineage() {
        let pool = pool();
        let source = AgentId::generate();
        pool.create(source.clone(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();
        let agent = pool.agent(&source).unwrap();
        agent.enqueue(crate::agent_loop::QueuedMessage::User("hi".into()));
        agent.step().await.unwrap();
        let snapshot = agent.snapshot(Some("s1".into())).await.unwrap();
        pool.store.save_snapshot(&snapshot).await.unwrap();

        let forked = pool
            .fork(&source, snapshot.id.as_str(), PoolConfig { options: test_options(), template_id: "t".into(), template_version: "1".into() })
            .await
            .unwrap();
        let history = forked.history().await;
        assert_eq!(history.len(), snapshot.messages.len());

        let forked_ids: Vec<AgentId> = pool.live_ids().into_iter().filter(|i| *i != source).collect();
        let info = pool.store.load_info(&forked_ids[0]).await.unwrap().unwrap();
        assert!(info.lineage.contains(&source));
    }
}
