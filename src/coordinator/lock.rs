//! Cross-process directory lock
//!
//! Creating a directory is atomic and fails when it already exists on every
//! platform and filesystem we care about, so `<target>.lock` serves as a
//! portable mutex between processes. The lock is released when the guard drops.

use crate::config::LockConfig;
use crate::error::Result;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Guard for a `<target>.lock` directory
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    held: bool,
}

impl DirLock {
    /// Lock directory path for `target`
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = OsString::from(target.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock for `target`, polling until it is free
    ///
    /// A lock directory older than `stale_after` is considered abandoned and
    /// removed, one waiter at a time. After `acquire_timeout` the lock is
    /// bypassed: the returned guard reports [`held`](Self::held) as false and
    /// removes nothing on drop.
    pub async fn acquire(target: &Path, config: &LockConfig) -> Result<Self> {
        let path = Self::lock_path(target);
        let started = Instant::now();
        let mut created_parent = false;

        loop {
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    tracing::trace!(lock = %path.display(), "Acquired directory lock");
                    return Ok(Self { path, held: true });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, config).await && break_stale(&path, config).await {
                        continue;
                    }

                    if started.elapsed() >= config.acquire_timeout {
                        tracing::warn!(
                            lock = %path.display(),
                            waited_secs = started.elapsed().as_secs_f64(),
                            "Timed out waiting for directory lock; bypassing"
                        );
                        return Ok(Self { path, held: false });
                    }

                    tokio::time::sleep(config.poll_interval).await;
                }
                Err(e) if e.kind() == ErrorKind::NotFound && !created_parent => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    created_parent = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether this guard owns the lock directory (false after a bypass)
    pub fn held(&self) -> bool {
        self.held
    }

    /// Path of the lock directory
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = std::fs::remove_dir(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(lock = %self.path.display(), error = %e, "Failed to release directory lock");
        }
    }
}

/// Remove an abandoned lock at `path`; returns whether it was removed
///
/// Breakers serialize on a `<lock>.break` directory and re-check staleness
/// while holding it, so a lock that another waiter broke and re-created in the
/// meantime is left alone.
pub(crate) async fn break_stale(path: &Path, config: &LockConfig) -> bool {
    let breaker = breaker_path(path);
    match tokio::fs::create_dir(&breaker).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // A breaker that died mid-break must not wedge the lock forever
            if is_stale(&breaker, config).await
                && let Err(e) = tokio::fs::remove_dir(&breaker).await
                && e.kind() != ErrorKind::NotFound
            {
                tracing::debug!(lock = %breaker.display(), error = %e, "Failed to remove stale breaker");
            }
            return false;
        }
        Err(e) => {
            tracing::debug!(lock = %breaker.display(), error = %e, "Failed to create breaker");
            return false;
        }
    }

    let broken = if is_stale(path, config).await {
        tracing::warn!(
            lock = %path.display(),
            stale_after_secs = config.stale_after.as_secs(),
            "Breaking stale directory lock"
        );
        match tokio::fs::remove_dir(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::debug!(lock = %path.display(), error = %e, "Failed to remove stale lock");
                false
            }
        }
    } else {
        false
    };

    if let Err(e) = tokio::fs::remove_dir(&breaker).await {
        tracing::warn!(lock = %breaker.display(), error = %e, "Failed to release breaker");
    }
    broken
}

fn breaker_path(lock: &Path) -> PathBuf {
    let mut name = OsString::from(lock.as_os_str());
    name.push(".break");
    PathBuf::from(name)
}

async fn is_stale(path: &Path, config: &LockConfig) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= config.stale_after)
}
