//! Filesystem/command-execution surface consumed by built-in tools (spec §6).
//!
//! `Sandbox` is an external collaborator: the kernel depends only on the trait.
//! No production implementation ships here (local/container/remote sandboxes are
//! out of scope per spec §1) — only `InMemorySandbox`, used by tests and the
//! bundled examples, in the same spirit as `store::InMemoryStore`.

use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options accepted by `Sandbox::exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

/// Outcome of `Sandbox::exec`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Callback invoked by a `Sandbox` implementation when a watched path changes.
/// Boxed rather than generic so `FileWatcher` can hold a heterogeneous set of
/// watches without becoming generic itself.
pub type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Boundary-enforcing filesystem and command surface used by built-in tools
/// (spec §6 "Sandbox (consumed)"). Path confinement is the implementation's
/// contract — the kernel only calls through this trait.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Resolves `path` against the sandbox root, rejecting escapes.
    fn resolve_path(&self, path: &str) -> Result<PathBuf>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;
    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;
    async fn grep(&self, pattern: &str, path: &str) -> Result<Vec<String>>;
    async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecOutput>;

    /// Registers `cb` to fire whenever one of `paths` changes. Returns a
    /// disposer that cancels the watch.
    fn watch_files(&self, paths: Vec<PathBuf>, cb: WatchCallback) -> Box<dyn FnOnce() + Send>;

    async fn dispose(&self) -> Result<()>;
}

/// An in-process, in-memory `Sandbox` used by tests and examples. Watches are
/// triggered explicitly via `touch` rather than real filesystem events, since
/// there is nothing on disk to watch.
#[derive(Default)]
pub struct InMemorySandbox {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    watches: Mutex<Vec<(PathBuf, WatchCallback)>>,
}

impl InMemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an external modification to `path`, firing any matching watch.
    pub fn touch(&self, path: &Path) {
        let watches = self.watches.lock();
        for (watched, cb) in watches.iter() {
            if watched == path {
                cb(path);
            }
        }
    }
}

#[async_trait]
impl Sandbox for InMemorySandbox {
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(path))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(Path::new(path))
            .cloned()
            .ok_or_else(|| crate::Error::tool(format!("no such file: {path}")))
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.files
            .lock()
            .insert(PathBuf::from(path), contents.to_vec());
        Ok(())
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|p| p.to_string_lossy().contains(pattern.trim_matches('*')))
            .cloned()
            .collect())
    }

    async fn grep(&self, pattern: &str, path: &str) -> Result<Vec<String>> {
        let contents = self.read(path).await?;
        let text = String::from_utf8_lossy(&contents);
        Ok(text
            .lines()
            .filter(|line| line.contains(pattern))
            .map(|line| line.to_string())
            .collect())
    }

    async fn exec(&self, command: &str, _opts: ExecOptions) -> Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: format!("InMemorySandbox does not execute commands: {command}"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn watch_files(&self, paths: Vec<PathBuf>, cb: WatchCallback) -> Box<dyn FnOnce() + Send> {
        let mut watches = self.watches.lock();
        for path in paths {
            watches.push((path, cb.clone()));
        }
        Box::new(|| {})
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let sandbox = InMemorySandbox::new();
        sandbox.write("/tmp/x", b"hello").await.unwrap();
        assert_eq!(sandbox.read("/tmp/x").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn read_missing_file_errors() {
        let sandbox = InMemorySandbox::new();
        assert!(sandbox.read("/nope").await.is_err());
    }

    #[tokio::test]
    async fn grep_filters_matching_lines() {
        let sandbox = InMemorySandbox::new();
        sandbox.write("/log", b"ok\nerror: boom\nok").await.unwrap();
        let hits = sandbox.grep("error", "/log").await.unwrap();
        assert_eq!(hits, vec!["error: boom".to_string()]);
    }

    #[tokio::test]
    async fn touch_fires_registered_watch() {
        let sandbox = InMemorySandbox::new();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        sandbox.watch_files(
            vec![PathBuf::from("/tmp/x")],
            Arc::new(move |_| fired2.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        sandbox.touch(Path::new("/tmp/x"));
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
