//! Mutual exclusion for shared target paths
//!
//! Several downloads may target the same shared artifact (one cover image per
//! album folder) at the same time, from this process or another one. The
//! [`ResourceCoordinator`] serializes them in two layers:
//!
//! - an in-process gate (a one-permit semaphore) keyed by
//!   `(coordinator context, normalized path)`, so tasks in one process queue up
//!   cheaply instead of polling the filesystem
//! - a [`DirLock`] on `<target>.lock`, which excludes other processes
//!
//! [`ResourceCoordinator::populate`] builds the write-once protocol on top:
//! lock, re-check, write to a temporary path, place without clobbering.

mod lock;
mod temp;


pub use lock::DirLock;
pub use temp::{TempGuard, TempRegistry};

use crate::config::LockConfig;
use crate::error::Result;
use crate::utils::normalize_path;
use rand::Rng;
use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type GateKey = (u64, PathBuf);

static GATES: OnceLock<Mutex<HashMap<GateKey, Arc<Semaphore>>>> = OnceLock::new();
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

fn gates() -> &'static Mutex<HashMap<GateKey, Arc<Semaphore>>> {
    GATES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Result of [`ResourceCoordinator::populate`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// This call wrote the target
    Written,
    /// The target already existed, or a concurrent writer placed it first
    AlreadyPresent,
}

/// Serializes writers of shared target paths
#[derive(Clone, Debug)]
pub struct ResourceCoordinator {
    context: u64,
    lock_config: LockConfig,
    registry: Arc<TempRegistry>,
}

/// Exclusive access to one shared target path
///
/// Releases the directory lock, then the in-process gate, when dropped.
/// Field order is drop order.
#[derive(Debug)]
pub struct SharedPathGuard {
    lock: DirLock,
    _permit: OwnedSemaphorePermit,
    _gate: GateRef,
}

/// A reference to one entry of the gate map
///
/// The last reference to drop removes the entry.
#[derive(Debug)]
struct GateRef {
    key: GateKey,
    semaphore: Arc<Semaphore>,
}

impl Drop for GateRef {
    fn drop(&mut self) {
        let mut gates = gates().lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this reference; anyone else waiting or holding keeps it alive
        if Arc::strong_count(&self.semaphore) == 2
            && gates
                .get(&self.key)
                .is_some_and(|gate| Arc::ptr_eq(gate, &self.semaphore))
        {
            gates.remove(&self.key);
        }
    }
}

impl SharedPathGuard {
    /// Whether the cross-process lock is actually held (false after a timeout bypass)
    pub fn holds_lock(&self) -> bool {
        self.lock.held()
    }
}

impl ResourceCoordinator {
    /// Create a coordinator with its own gate context
    pub fn new(lock_config: LockConfig) -> Self {
        Self::with_registry(lock_config, TempRegistry::global())
    }

    /// Create a coordinator that reports abandoned temp files to `registry`
    pub fn with_registry(lock_config: LockConfig, registry: Arc<TempRegistry>) -> Self {
        Self {
            context: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            lock_config,
            registry,
        }
    }

    /// Gate context id
    pub fn context(&self) -> u64 {
        self.context
    }

    fn gate(&self, normalized: &Path) -> GateRef {
        let key = (self.context, normalized.to_path_buf());
        let mut gates = gates().lock().unwrap_or_else(PoisonError::into_inner);
        let semaphore = gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        GateRef { key, semaphore }
    }

    /// Acquire exclusive access to `target`
    pub async fn lock(&self, target: &Path) -> Result<SharedPathGuard> {
        let target = normalize_path(target)?;
        let gate = self.gate(&target);
        let permit = gate
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| crate::error::Error::download("acquiring path gate", e))?;
        let lock = DirLock::acquire(&target, &self.lock_config).await?;
        Ok(SharedPathGuard {
            lock,
            _permit: permit,
            _gate: gate,
        })
    }

    /// Write `target` exactly once across concurrent callers
    ///
    /// Under the lock, an existing target short-circuits without calling `writer`.
    /// Otherwise `writer` fills a temporary sibling path, which is then placed at
    /// `target` without overwriting; if another writer won the race the temporary
    /// file is discarded and the call still succeeds.
    pub async fn populate<F, Fut>(&self, target: &Path, writer: F) -> Result<PopulateOutcome>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.lock(target).await?;

        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            tracing::debug!(target = %target.display(), "Shared target already present");
            return Ok(PopulateOutcome::AlreadyPresent);
        }

        let temp = temp_sibling(target);
        let guard = TempGuard::new(temp.clone(), self.registry.clone());

        if let Err(e) = writer(temp.clone()).await {
            guard.remove().await;
            return Err(e);
        }

        let outcome = place_no_clobber(&temp, target).await;
        guard.remove().await;
        let outcome = outcome?;

        if outcome == PopulateOutcome::AlreadyPresent {
            tracing::debug!(target = %target.display(), "Lost placement race; discarded temporary file");
        }
        Ok(outcome)
    }

    /// Number of gates currently held for this coordinator
    pub fn gate_count(&self) -> usize {
        gates()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(context, _)| *context == self.context)
            .count()
    }
}

/// `<target>.<pid>.<salt>.tmp` in the target's directory
fn temp_sibling(target: &Path) -> PathBuf {
    let salt: u32 = rand::thread_rng().r#gen();
    let mut name = OsString::from(target.as_os_str());
    name.push(format!(".{}.{:08x}.tmp", std::process::id(), salt));
    PathBuf::from(name)
}

/// Move `temp` to `target` unless `target` exists
///
/// Hard-linking fails atomically when the destination exists. Filesystems
/// without hard links fall back to an existence check followed by a rename.
async fn place_no_clobber(temp: &Path, target: &Path) -> Result<PopulateOutcome> {
    match tokio::fs::hard_link(temp, target).await {
        Ok(()) => Ok(PopulateOutcome::Written),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(PopulateOutcome::AlreadyPresent),
        Err(e) => {
            tracing::debug!(error = %e, "Hard link unavailable; falling back to rename");
            if tokio::fs::try_exists(target).await.unwrap_or(false) {
                return Ok(PopulateOutcome::AlreadyPresent);
            }
            tokio::fs::rename(temp, target).await?;
            Ok(PopulateOutcome::Written)
        }
    }
}
