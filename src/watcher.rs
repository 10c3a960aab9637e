//! Re-enqueues a reminder when a watched path changes (spec §4.11).
//!
//! `FileWatcher` holds no OS-level file-event code itself — it asks whatever
//! `Sandbox` the agent is bound to for the actual watch (`Sandbox::watch_files`)
//! and, when the callback fires, records the change and marks a reminder
//! pending for the next `AgentLoop` poll. Mirrors `TodoManager`/`Scheduler`'s
//! "poll it from the loop, don't run your own thread" shape.

use crate::sandbox::Sandbox;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Tracks paths that changed since the last drain.
#[derive(Default)]
struct WatchState {
    changed: HashSet<PathBuf>,
}

/// Watches a fixed set of paths for the lifetime of an agent.
pub struct FileWatcher {
    state: Arc<Mutex<WatchState>>,
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl FileWatcher {
    /// Registers a watch on `paths` through `sandbox`. Call `dispose` (or drop
    /// the returned value) to cancel.
    pub fn watch(sandbox: &dyn Sandbox, paths: Vec<PathBuf>) -> Self {
        let state = Arc::new(Mutex::new(WatchState::default()));
        let state_for_cb = state.clone();
        let disposer = sandbox.watch_files(
            paths,
            Arc::new(move |path| {
                state_for_cb.lock().unwrap().changed.insert(path.to_path_buf());
            }),
        );
        Self { state, disposer: Some(disposer) }
    }

    /// Drains and returns every path that changed since the last call. An
    /// empty result means no `file_changed` reminder should be enqueued.
    pub fn drain_changes(&self) -> Vec<PathBuf> {
        let mut guard = self.state.lock().unwrap();
        guard.changed.drain().collect()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().unwrap().changed.is_empty()
    }

    pub fn dispose(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::InMemorySandbox;

    #[test]
    fn touch_is_recorded_and_drained_once() {
        let sandbox = InMemorySandbox::new();
        let watcher = FileWatcher::watch(&sandbox, vec![PathBuf::from("/tmp/x")]);
        assert!(!watcher.has_pending_changes());

        sandbox.touch(std::path::Path::new("/tmp/x"));
        assert!(watcher.has_pending_changes());

        let changes = watcher.drain_changes();
        assert_eq!(changes, vec![PathBuf::from("/tmp/x")]);
        assert!(!watcher.has_pending_changes());
    }

    #[test]
    fn untouched_paths_produce_no_changes() {
        let sandbox = InMemorySandbox::new();
        let watcher = FileWatcher::watch(&sandbox, vec![PathBuf::from("/tmp/y")]);
        sandbox.touch(std::path::Path::new("/tmp/other"));
        assert!(watcher.drain_changes().is_empty());
    }
}
