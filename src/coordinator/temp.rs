//! Process-wide registry of temporary paths awaiting cleanup
//!
//! Paths are registered when a transfer is abandoned without cleaning up after
//! itself (cancellation, a dropped future, a failed delete). [`TempRegistry::sweep`]
//! deletes what it can and keeps the rest registered for the next pass.

use crate::types::SweepReport;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

static GLOBAL_REGISTRY: OnceLock<Arc<TempRegistry>> = OnceLock::new();

/// Registry of temporary files and directories
#[derive(Debug, Default)]
pub struct TempRegistry {
    entries: Mutex<HashSet<PathBuf>>,
}

impl TempRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, initialized on first use and never reset
    pub fn global() -> Arc<TempRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(TempRegistry::new()))
            .clone()
    }

    /// Track `path` for deletion by the next sweep
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::debug!(path = %path.display(), "Registered temporary path for cleanup");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path);
    }

    /// Stop tracking `path`; returns whether it was registered
    pub fn unregister(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
    }

    /// Whether `path` is awaiting cleanup
    pub fn contains(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    /// Number of paths awaiting cleanup
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is awaiting cleanup
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every registered path
    ///
    /// Directories are removed recursively. A path that no longer exists counts as
    /// removed. Paths that fail to delete stay registered.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_with(remove_path)
    }

    pub(crate) fn sweep_with<F>(&self, mut remover: F) -> SweepReport
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        // Snapshot so the lock is not held across filesystem calls
        let snapshot: Vec<PathBuf> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        let mut report = SweepReport::default();
        for path in snapshot {
            match remover(&path) {
                Ok(()) => {
                    self.unregister(&path);
                    report.removed.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.unregister(&path);
                    report.removed.push(path);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove temporary path; will retry on next sweep"
                    );
                    report.retained.push(path);
                }
            }
        }
        report
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Registers a temporary path for cleanup if dropped while armed
///
/// The owner disarms the guard once the path has been renamed into place or
/// deleted. A guard dropped while armed (cancellation, panic, early return)
/// leaves the path to the registry's next sweep.
#[derive(Debug)]
pub struct TempGuard {
    path: PathBuf,
    registry: Arc<TempRegistry>,
    armed: bool,
}

impl TempGuard {
    /// Guard `path`
    pub fn new(path: impl Into<PathBuf>, registry: Arc<TempRegistry>) -> Self {
        Self {
            path: path.into(),
            registry,
            armed: true,
        }
    }

    /// The guarded path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path no longer needs cleanup
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Delete the path now and disarm; on failure the path goes to the registry
    pub async fn remove(mut self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => self.disarm(),
            Err(e) if e.kind() == ErrorKind::NotFound => self.disarm(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.register(self.path.clone());
        }
    }
}
