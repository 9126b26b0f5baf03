//! Per-item execution pipeline
//!
//! [`Downloader::download_with`] takes one descriptor from "maybe already on
//! disk" to "validated file in place":
//!
//! 1. **Preflight**: an existing valid target short-circuits with
//!    `metadata.skipped = true` unless `overwrite_existing` is set
//! 2. **Storage check**: refuse (without retrying) when the target volume would
//!    drop below `min_free_space_mb`
//! 3. **Attempt loop**: stream the body into a partial file, up to
//!    `max_retries + 1` attempts with the configured backoff between them
//! 4. **Validation**: checksum and size mismatches remove the partial file and
//!    count as a failed attempt
//! 5. **Finalize**: rename into place, then run the post-processing hook
//! 6. **Exhaustion**: remove the partial file and report the last error
//!
//! Failures inside an attempt never escape as `Err`; they end up in a
//! [`DownloadResult`] with `success = false`. Only invalid configuration is
//! returned as an error.

mod fetcher;


pub use fetcher::{ByteStream, ContentFetcher, HttpFetcher, PostProcessor};

use crate::config::{BehaviorSettings, Config};
use crate::coordinator::{PopulateOutcome, ResourceCoordinator, TempGuard, TempRegistry};
use crate::descriptor::{ContentDescriptor, checksum_file};
use crate::error::{Error, ErrorKind, Result};
use crate::progress::{self, DownloadProgress, SharedObserver};
use crate::retry::{IsRetryable, next_delay};
use crate::session::SessionManager;
use crate::types::{DownloadResult, TaskId};
use crate::utils::get_available_space;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Everything one pipeline invocation needs
pub struct DownloadRequest {
    /// Id reported in progress callbacks and the result
    pub task_id: TaskId,

    /// What to download
    pub descriptor: ContentDescriptor,

    /// Directory the finished file goes into
    pub target_dir: PathBuf,

    /// Behavior override (None = the configured behavior for the descriptor's source)
    pub settings: Option<BehaviorSettings>,

    /// Receives cumulative byte counts on every chunk
    pub observer: Option<SharedObserver>,

    /// Cooperative cancellation, checked at every suspension point
    pub cancel: CancellationToken,
}

impl DownloadRequest {
    /// Request with a fresh task id and no overrides
    pub fn new(descriptor: ContentDescriptor, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id: TaskId::next(),
            descriptor,
            target_dir: target_dir.into(),
            settings: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: report under `task_id`
    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    /// Builder: override the behavior settings
    pub fn with_settings(mut self, settings: BehaviorSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Builder: attach a progress observer
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builder: use an external cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The execution pipeline
pub struct Downloader {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    fetcher: Arc<dyn ContentFetcher>,
    coordinator: ResourceCoordinator,
    registry: Arc<TempRegistry>,
    post_processor: Option<Arc<dyn PostProcessor>>,
}

impl Downloader {
    /// Validate `config` and build a pipeline that fetches over HTTP
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.clone()));
        let registry = TempRegistry::global();
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(sessions.clone())),
            coordinator: ResourceCoordinator::with_registry(config.lock.clone(), registry.clone()),
            config,
            sessions,
            registry,
            post_processor: None,
        })
    }

    /// Replace the transport
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Install a post-processing hook
    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Report abandoned partial files to `registry` instead of the process-wide one
    pub fn with_temp_registry(mut self, registry: Arc<TempRegistry>) -> Self {
        self.coordinator =
            ResourceCoordinator::with_registry(self.config.lock.clone(), registry.clone());
        self.registry = registry;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session layer
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Shared-path coordinator
    pub fn coordinator(&self) -> &ResourceCoordinator {
        &self.coordinator
    }

    /// Registry receiving abandoned partial files
    pub fn temp_registry(&self) -> &Arc<TempRegistry> {
        &self.registry
    }

    /// Download `descriptor` into `target_dir` with the configured behavior
    pub async fn download(
        &self,
        descriptor: &ContentDescriptor,
        target_dir: &Path,
    ) -> Result<DownloadResult> {
        self.download_with(DownloadRequest::new(descriptor.clone(), target_dir))
            .await
    }

    /// Run the pipeline for one request
    ///
    /// Returns `Err` only when the effective behavior settings are invalid.
    pub async fn download_with(&self, request: DownloadRequest) -> Result<DownloadResult> {
        let settings = match &request.settings {
            Some(settings) => settings.clone(),
            None => self.config.behavior_for_source(&request.descriptor.source),
        };
        settings.validate()?;

        let started = Instant::now();
        let target = request.descriptor.target_path(&request.target_dir);

        tracing::info!(
            task_id = %request.task_id,
            item = %request.descriptor.display_name(),
            target = %target.display(),
            "Starting download"
        );

        // Shared assets are written under the coordinator so concurrent
        // attempts for the same path do one physical write
        let _shared_guard = if request.descriptor.content_type.is_shared_asset() {
            match self.coordinator.lock(&target).await {
                Ok(guard) => Some(guard),
                Err(e) => return Ok(failed_result(request.task_id, &e, 0, started, 0)),
            }
        } else {
            None
        };

        Ok(self.run(&request, &settings, &target, started).await)
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        settings: &BehaviorSettings,
        target: &Path,
        started: Instant,
    ) -> DownloadResult {
        let descriptor = &request.descriptor;
        let task_id = request.task_id;

        // Preflight
        if !settings.overwrite_existing
            && let Some(existing) = self.existing_valid_file(descriptor, target).await
        {
            tracing::info!(task_id = %task_id, target = %target.display(), "File already present; skipping");
            return skipped_result(task_id, target, existing, started);
        }

        if let Err(e) = tokio::fs::create_dir_all(&request.target_dir).await {
            return failed_result(task_id, &Error::from(e), 0, started, 0);
        }
        let part_path = self.partial_path(target, settings);
        if let Some(parent) = part_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return failed_result(task_id, &Error::from(e), 0, started, 0);
        }

        // Storage check
        if let Err(e) = check_storage(settings, descriptor, &request.target_dir) {
            tracing::warn!(task_id = %task_id, error = %e, "Refusing download: insufficient storage");
            return failed_result(task_id, &e, 0, started, 0);
        }

        // Attempt loop
        let mut part = TempGuard::new(part_path, self.registry.clone());
        let mut attempt: u32 = 0;
        let mut transferred: u64 = 0;
        let last_error = loop {
            let outcome = self.attempt(request, settings, part.path()).await;
            let error = match outcome {
                Ok(bytes) => {
                    transferred += bytes;
                    match self.validate(descriptor, settings, part.path()).await {
                        // Nothing reaches the target once cancelled
                        Ok(_) if request.cancel.is_cancelled() => Error::Cancelled,
                        Ok(digest) => match finalize(part.path(), target).await {
                            Ok(()) => {
                                part.disarm();
                                return self
                                    .finish(request, target, digest, attempt, started, transferred)
                                    .await;
                            }
                            Err(e) => e,
                        },
                        Err(e) => {
                            tracing::warn!(task_id = %task_id, error = %e, "Validation failed; discarding partial file");
                            discard(&part).await;
                            e
                        }
                    }
                }
                Err(e) => {
                    if !settings.enable_resume || matches!(e, Error::Cancelled) {
                        discard(&part).await;
                    }
                    e
                }
            };

            if matches!(error, Error::Cancelled) {
                tracing::info!(task_id = %task_id, "Download cancelled");
                part.remove().await;
                return failed_result(task_id, &error, attempt, started, transferred);
            }
            if !error.is_retryable() || attempt >= settings.max_retries {
                break error;
            }

            let delay = next_delay(settings, attempt, &error);
            tracing::warn!(
                task_id = %task_id,
                attempt = attempt + 1,
                max_attempts = settings.max_retries + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Download attempt failed, retrying after delay"
            );
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    tracing::info!(task_id = %task_id, "Download cancelled during backoff");
                    part.remove().await;
                    return failed_result(task_id, &Error::Cancelled, attempt, started, transferred);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        };

        // Exhaustion
        part.remove().await;
        tracing::error!(
            task_id = %task_id,
            attempts = attempt + 1,
            error = %last_error,
            "Download failed"
        );
        failed_result(task_id, &last_error, attempt, started, transferred)
    }

    /// One transfer attempt into `part`; returns the bytes received
    async fn attempt(
        &self,
        request: &DownloadRequest,
        settings: &BehaviorSettings,
        part: &Path,
    ) -> Result<u64> {
        let offset = if settings.enable_resume {
            tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let timeout = settings.timeout();
        let mut stream = tokio::select! {
            _ = request.cancel.cancelled() => return Err(Error::Cancelled),
            opened = tokio::time::timeout(timeout, self.fetcher.open(&request.descriptor, offset)) => {
                opened.map_err(|_| Error::Network {
                    message: format!("opening {} timed out after {}s", request.descriptor.url, timeout.as_secs()),
                    status: None,
                })??
            }
        };

        let resumed = offset > 0 && stream.resumed();
        let file = if resumed {
            tracing::info!(task_id = %request.task_id, offset, "Resuming partial download");
            tokio::fs::OpenOptions::new().append(true).open(part).await?
        } else {
            tokio::fs::File::create(part).await?
        };
        let mut writer = tokio::io::BufWriter::with_capacity(settings.chunk_size, file);

        let mut tracker =
            DownloadProgress::new(stream.total_size().or(request.descriptor.expected_size_bytes));
        if resumed {
            tracker.resume_from(offset);
        }

        loop {
            let next = tokio::select! {
                _ = request.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = tokio::time::timeout(timeout, stream.next_chunk()) => {
                    chunk.map_err(|_| Error::Network {
                        message: format!("body read timed out after {}s", timeout.as_secs()),
                        status: None,
                    })??
                }
            };
            let Some(chunk) = next else {
                break;
            };

            writer.write_all(&chunk).await?;
            tracker.advance(chunk.len() as u64);
            if let Some(observer) = &request.observer {
                progress::notify(
                    observer.as_ref(),
                    request.task_id,
                    tracker.downloaded(),
                    tracker.total(),
                );
            }
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if let Some(total) = stream.total_size()
            && tracker.downloaded() < total
        {
            return Err(Error::Network {
                message: format!(
                    "body ended after {} of {} bytes",
                    tracker.downloaded(),
                    total
                ),
                status: None,
            });
        }

        let received = tracker.downloaded() - if resumed { offset } else { 0 };
        tracing::debug!(
            task_id = %request.task_id,
            bytes = received,
            speed_bps = tracker.average_speed_bps(),
            "Transfer finished"
        );
        Ok(received)
    }

    /// Post-validation; returns the computed digest when a checksum was verified
    async fn validate(
        &self,
        descriptor: &ContentDescriptor,
        settings: &BehaviorSettings,
        part: &Path,
    ) -> Result<Option<String>> {
        let mut digest = None;
        if settings.verify_checksums
            && let Some(expected) = &descriptor.checksum
        {
            let actual = checksum_file(descriptor.checksum_algorithm, part).await?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(Error::ChecksumMismatch {
                    path: part.to_path_buf(),
                    expected: expected.clone(),
                    actual,
                });
            }
            digest = Some(actual);
        }

        if settings.verify_file_size
            && let Some(expected) = descriptor.expected_size_bytes
        {
            let actual = tokio::fs::metadata(part).await?.len();
            if actual != expected {
                return Err(Error::FileSizeMismatch {
                    path: part.to_path_buf(),
                    expected,
                    actual,
                });
            }
        }
        Ok(digest)
    }

    /// Success bookkeeping and the post-processing hook
    async fn finish(
        &self,
        request: &DownloadRequest,
        target: &Path,
        digest: Option<String>,
        attempt: u32,
        started: Instant,
        transferred: u64,
    ) -> DownloadResult {
        let size = tokio::fs::metadata(target).await.map(|m| m.len()).ok();
        let duration = started.elapsed().as_secs_f64();

        tracing::info!(
            task_id = %request.task_id,
            target = %target.display(),
            bytes = size.unwrap_or(0),
            retries = attempt,
            "Download complete"
        );

        if let Some(post) = &self.post_processor {
            let outcome = AssertUnwindSafe(post.process(&request.descriptor, target))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(task_id = %request.task_id, error = %e, "Post-processing failed");
                }
                Err(_) => {
                    tracing::warn!(task_id = %request.task_id, "Post-processing panicked");
                }
            }
        }

        DownloadResult {
            task_id: request.task_id,
            success: true,
            file_path: Some(target.to_path_buf()),
            file_size_bytes: size,
            checksum: digest,
            duration_seconds: duration,
            average_speed_bps: average_speed(transferred, duration),
            error_message: None,
            error_kind: None,
            retryable: false,
            retry_count: attempt,
            metadata: HashMap::new(),
        }
    }

    /// The target's size when it exists and passes the declared checks
    ///
    /// With a declared checksum the checksum decides; otherwise a declared size
    /// must match; otherwise presence is enough.
    async fn existing_valid_file(
        &self,
        descriptor: &ContentDescriptor,
        target: &Path,
    ) -> Option<u64> {
        let metadata = tokio::fs::metadata(target).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        let valid = if descriptor.checksum.is_some() {
            descriptor.validate_checksum(target).await
        } else if let Some(expected) = descriptor.expected_size_bytes {
            metadata.len() == expected
        } else {
            true
        };
        valid.then_some(metadata.len())
    }

    fn partial_path(&self, target: &Path, settings: &BehaviorSettings) -> PathBuf {
        let mut name = target
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("download"));
        name.push(&settings.temp_file_suffix);
        match &self.config.temp_dir {
            Some(dir) => dir.join(name),
            None => target.with_file_name(name),
        }
    }

    /// Download many descriptors with at most `max_concurrent` in flight
    ///
    /// One failure never aborts its siblings. Results come back in input order.
    pub async fn download_many(
        &self,
        descriptors: Vec<ContentDescriptor>,
        target_dir: &Path,
        max_concurrent: usize,
    ) -> Result<Vec<DownloadResult>> {
        for descriptor in &descriptors {
            self.config
                .behavior_for_source(&descriptor.source)
                .validate()?;
        }

        let mut results: Vec<(usize, DownloadResult)> =
            futures::stream::iter(descriptors.into_iter().enumerate())
                .map(|(index, descriptor)| async move {
                    let started = Instant::now();
                    let request = DownloadRequest::new(descriptor, target_dir);
                    let task_id = request.task_id;
                    let result = match self.download_with(request).await {
                        Ok(result) => result,
                        Err(e) => failed_result(task_id, &e, 0, started, 0),
                    };
                    (index, result)
                })
                .buffer_unordered(max_concurrent.max(1))
                .collect()
                .await;

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<DownloadResult> = results.into_iter().map(|(_, r)| r).collect();

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(total = results.len(), failed, "Bulk download finished");
        Ok(results)
    }

    /// Fetch one auxiliary file (cover art and the like) to a shared path
    ///
    /// Concurrent calls for the same `target`, from this or another process,
    /// result in a single physical write. Returns whether this call wrote it.
    pub async fn fetch_shared_asset(
        &self,
        url: &str,
        source: &str,
        target: &Path,
    ) -> Result<PopulateOutcome> {
        let session = self.sessions.session(source).await?;
        self.coordinator
            .populate(target, |temp| async move {
                let body = session.fetch_bytes(url).await?;
                tokio::fs::write(&temp, &body).await?;
                Ok::<(), Error>(())
            })
            .await
    }
}

/// Refuse when free space would drop below the configured reserve
///
/// A failed free-space query is logged and does not block the download.
fn check_storage(
    settings: &BehaviorSettings,
    descriptor: &ContentDescriptor,
    dir: &Path,
) -> Result<()> {
    let Some(reserve) = settings.min_free_space_bytes() else {
        return Ok(());
    };
    let required = reserve.saturating_add(descriptor.expected_size_bytes.unwrap_or(0));

    match get_available_space(dir) {
        Ok(available) if available < required => Err(Error::InsufficientStorage {
            required,
            available,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Could not query free space; proceeding");
            Ok(())
        }
    }
}

/// Rename the partial file into place, copying across volumes
async fn finalize(part: &Path, target: &Path) -> Result<()> {
    match tokio::fs::rename(part, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(part, target).await?;
            tokio::fs::remove_file(part).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the partial file but keep the guard armed for later attempts
async fn discard(part: &TempGuard) {
    if let Err(e) = tokio::fs::remove_file(part.path()).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %part.path().display(), error = %e, "Failed to remove partial file");
    }
}

fn average_speed(bytes: u64, seconds: f64) -> Option<f64> {
    (bytes > 0 && seconds > 0.0).then(|| bytes as f64 / seconds)
}

fn skipped_result(task_id: TaskId, target: &Path, size: u64, started: Instant) -> DownloadResult {
    DownloadResult {
        task_id,
        success: true,
        file_path: Some(target.to_path_buf()),
        file_size_bytes: Some(size),
        checksum: None,
        duration_seconds: started.elapsed().as_secs_f64(),
        average_speed_bps: None,
        error_message: None,
        error_kind: None,
        retryable: false,
        retry_count: 0,
        metadata: HashMap::from([
            ("skipped".to_string(), serde_json::Value::Bool(true)),
            (
                "reason".to_string(),
                serde_json::Value::String("file_exists".to_string()),
            ),
        ]),
    }
}

fn failed_result(
    task_id: TaskId,
    error: &Error,
    retry_count: u32,
    started: Instant,
    transferred: u64,
) -> DownloadResult {
    let duration = started.elapsed().as_secs_f64();
    let kind = error.kind();
    let mut metadata = HashMap::new();
    if kind == ErrorKind::Cancelled {
        metadata.insert("cancelled".to_string(), serde_json::Value::Bool(true));
    }
    DownloadResult {
        task_id,
        success: false,
        file_path: None,
        file_size_bytes: None,
        checksum: None,
        duration_seconds: duration,
        average_speed_bps: average_speed(transferred, duration),
        error_message: Some(error.to_string()),
        error_kind: Some(kind),
        retryable: error.is_retryable(),
        retry_count,
        metadata,
    }
}
