//! Bounded worker pool tying the queue to the pipeline
//!
//! [`DownloadEngine::start`] spawns a queue processor that repeatedly:
//! 1. Acquires a permit from the concurrency limiter (`max_concurrent_downloads`)
//! 2. Takes the next ready task from the [`DownloadQueue`]
//! 3. Spawns the pipeline for it and reports the outcome back to the queue
//!
//! Completion promotes dependents immediately. Retryable failures are handed
//! back to the queue, which re-queues them behind other ready work; failures
//! that cannot change on retry (authentication, not found, permission,
//! storage) are terminal at the queue as well.

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::descriptor::ContentDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::{DownloadRequest, Downloader};
use crate::progress::{self, ProgressObserver, SharedObserver};
use crate::queue::{DownloadQueue, Task};
use crate::types::{DownloadResult, Priority, QueueEvent, TaskId, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval between queue polling attempts when nothing is ready
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long shutdown waits for in-flight downloads to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider seam: turns a catalog id into a descriptor
///
/// The engine never talks to a catalog API itself.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Resolve `content_id` into a downloadable descriptor
    async fn resolve(&self, content_id: &str) -> Result<ContentDescriptor>;
}

/// Download engine
///
/// Cloning is cheap; clones share the queue, the pipeline and the worker pool.
#[derive(Clone)]
pub struct DownloadEngine {
    config: Arc<Config>,
    queue: Arc<DownloadQueue>,
    downloader: Arc<Downloader>,
    concurrent_limit: Arc<Semaphore>,
    active_downloads: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    resolver: Option<Arc<dyn ContentResolver>>,
    observer: Option<SharedObserver>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
}

impl DownloadEngine {
    /// Validate `config` and build an engine with an HTTP pipeline
    pub fn new(config: Config) -> Result<Self> {
        let downloader = Downloader::new(config)?;
        Ok(Self::with_downloader(downloader))
    }

    /// Build an engine around an existing pipeline, using its configuration
    pub fn with_downloader(downloader: Downloader) -> Self {
        let config = Arc::new(downloader.config().clone());
        Self {
            queue: Arc::new(DownloadQueue::from_config(&config)),
            concurrent_limit: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config,
            downloader: Arc::new(downloader),
            active_downloads: Arc::new(Mutex::new(HashMap::new())),
            resolver: None,
            observer: None,
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Builder: install the provider used by [`enqueue_content`](Self::enqueue_content)
    pub fn with_resolver(mut self, resolver: Arc<dyn ContentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Builder: forward byte-level progress of every task to `observer`
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The scheduler
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// The per-item pipeline
    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Start the queue processor
    ///
    /// The returned handle finishes after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                max_concurrent = engine.config.max_concurrent_downloads,
                "Queue processor started"
            );
            loop {
                // Take a permit before a task so nothing sits in DOWNLOADING
                // while waiting for a free slot
                let permit = tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    permit = engine.concurrent_limit.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                if let Some(task) = engine.queue.dequeue_next().await {
                    // Registered before the runner exists so a cancel landing
                    // now still finds the token
                    let cancel = engine.track(task.task_id).await;
                    let runner = engine.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        runner.run_task(task, cancel).await;
                    });
                } else {
                    drop(permit);
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => break,
                        _ = engine.wake.notified() => {}
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                    }
                }
            }
            tracing::info!("Queue processor stopped");
        })
    }

    /// Queue a task
    pub async fn enqueue(&self, task: Task) -> Result<TaskId> {
        task.descriptor.validate()?;
        let id = self.queue.enqueue(task).await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Resolve `content_id` through the configured [`ContentResolver`] and queue it
    pub async fn enqueue_content(&self, content_id: &str, priority: Priority) -> Result<TaskId> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::config("resolver", "no content resolver configured"))?;
        let descriptor = resolver.resolve(content_id).await?;
        tracing::debug!(content_id, item = %descriptor.display_name(), "Resolved content");
        self.enqueue(Task::new(descriptor).with_priority(priority))
            .await
    }

    /// Cancel a task
    ///
    /// The state changes immediately; an in-flight transfer stops at its next
    /// suspension point and its partial file is removed.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.queue.cancel(id).await?;
        if let Some(token) = self.active_downloads.lock().await.get(&id) {
            token.cancel();
        }
        tracing::info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    /// Number of downloads in flight
    pub async fn active_count(&self) -> usize {
        self.active_downloads.lock().await.len()
    }

    /// Wait until nothing is ready and nothing is downloading
    ///
    /// Tasks still deferred on dependencies that will never complete do not
    /// keep the engine busy.
    pub async fn wait_idle(&self) {
        loop {
            let stats = self.queue.stats().await;
            if stats.ready == 0
                && stats.downloading == 0
                && self.active_downloads.lock().await.is_empty()
            {
                return;
            }
            tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        }
    }

    /// Stop the processor, cancel in-flight downloads and close sessions
    pub async fn shutdown(&self) {
        tracing::info!("Initiating engine shutdown");
        self.shutdown.cancel();

        {
            let active = self.active_downloads.lock().await;
            for token in active.values() {
                token.cancel();
            }
        }

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while !self.active_downloads.lock().await.is_empty() {
                tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Timeout waiting for downloads to stop, proceeding with shutdown");
        }

        self.downloader.sessions().close_all().await;
        tracing::info!("Engine shutdown complete");
    }

    /// Register a cancellation token for a task that just left the ready heap
    async fn track(&self, id: TaskId) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.active_downloads.lock().await.insert(id, cancel.clone());
        cancel
    }

    async fn run_task(&self, task: Task, cancel: CancellationToken) {
        let id = task.task_id;
        if self.queue.get(id).await.map(|t| t.state) != Some(TaskState::Downloading) {
            tracing::debug!(task_id = %id, "Task left its downloading state before it started");
            self.untrack(id).await;
            return;
        }

        let target_dir = task
            .target_dir
            .clone()
            .unwrap_or_else(|| self.config.download_dir.clone());
        let observer: SharedObserver = Arc::new(QueueProgress {
            queue: self.queue.clone(),
            forward: self.observer.clone(),
            last_percent: AtomicU32::new(0),
        });
        let request = DownloadRequest::new(task.descriptor, target_dir)
            .with_task_id(id)
            .with_observer(observer)
            .with_cancel(cancel);

        let outcome = self.downloader.download_with(request).await;
        self.report(id, outcome).await;
        self.untrack(id).await;
    }

    async fn untrack(&self, id: TaskId) {
        self.active_downloads.lock().await.remove(&id);
        self.wake.notify_one();
    }

    /// Feed a pipeline outcome back into the queue
    async fn report(&self, id: TaskId, outcome: Result<DownloadResult>) {
        let (message, retryable) = match outcome {
            Ok(result) if result.success => {
                if let Err(e) = self.queue.complete(id).await {
                    tracing::warn!(task_id = %id, error = %e, "Could not mark task complete");
                }
                return;
            }
            Ok(result) if result.error_kind == Some(ErrorKind::Cancelled) => {
                // Cancelled through the queue already, or interrupted by shutdown
                if self.queue.get(id).await.map(|t| t.state) == Some(TaskState::Downloading)
                    && let Err(e) = self.queue.cancel(id).await
                {
                    tracing::debug!(task_id = %id, error = %e, "Task left its downloading state");
                }
                return;
            }
            Ok(result) => (
                result
                    .error_message
                    .unwrap_or_else(|| "download failed".to_string()),
                result.retryable,
            ),
            Err(e) => (e.to_string(), false),
        };

        match self.queue.fail_with(id, message, retryable).await {
            Ok(true) => tracing::info!(task_id = %id, "Task re-queued for another attempt"),
            Ok(false) => {}
            // Cancelled or removed while the pipeline was finishing
            Err(e) => tracing::debug!(task_id = %id, error = %e, "Failure not recorded"),
        }
    }
}

/// Observer that mirrors transfer progress into the queue
struct QueueProgress {
    queue: Arc<DownloadQueue>,
    forward: Option<SharedObserver>,
    last_percent: AtomicU32,
}

impl ProgressObserver for QueueProgress {
    fn on_progress(&self, task_id: TaskId, downloaded: u64, total: Option<u64>) {
        if let Some(forward) = &self.forward {
            progress::notify(forward.as_ref(), task_id, downloaded, total);
        }

        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let percent = (downloaded.saturating_mul(100) / total).min(100) as u32;
        // Only whole-percent steps reach the queue
        if self.last_percent.fetch_max(percent, Ordering::Relaxed) >= percent {
            return;
        }
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let _ = queue.update_progress(task_id, percent as f32).await;
        });
    }
}
