//! # ripstream-dl
//!
//! Resumable, verifiable bulk-download core for music streaming clients.
//!
//! ## Design Philosophy
//!
//! ripstream-dl is designed to be:
//! - **Provider-agnostic** - Catalog lookups, tagging and persistence are supplied by the host
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to queue events, no polling required
//!
//! ## Components
//!
//! - [`DownloadQueue`]: priority and dependency scheduler
//! - [`Downloader`]: per-item pipeline (preflight, storage check, retrying
//!   transfer, validation, atomic finalize)
//! - [`SessionManager`]: pooled per-source HTTP sessions with status classification
//! - [`ResourceCoordinator`]: cross-process exclusion for shared target paths
//! - [`DownloadEngine`]: bounded worker pool connecting the queue to the pipeline
//!
//! ## Quick Start
//!
//! ```no_run
//! use ripstream_dl::{Config, ContentDescriptor, DownloadEngine, Task};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(Config::default())?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let processor = engine.start();
//!     let descriptor = ContentDescriptor::new(
//!         "123",
//!         "qobuz",
//!         "https://cdn.example.com/123.flac",
//!         "01 - Intro",
//!         "flac",
//!     );
//!     engine.enqueue(Task::new(descriptor)).await?;
//!
//!     engine.wait_idle().await;
//!     engine.shutdown().await;
//!     processor.await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Shared-path exclusion and temporary file tracking
pub mod coordinator;
/// Content descriptors and checksums
pub mod descriptor;
/// Worker pool tying the queue to the pipeline
pub mod engine;
/// Error types
pub mod error;
/// Per-item execution pipeline
pub mod pipeline;
/// Progress reporting
pub mod progress;
/// Priority and dependency scheduler
pub mod queue;
/// Retry logic with configurable backoff
pub mod retry;
/// Pooled HTTP sessions
pub mod session;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{BehaviorSettings, Config, DanglingDependencyPolicy, LockConfig, SourceSettings};
pub use coordinator::{PopulateOutcome, ResourceCoordinator, TempGuard, TempRegistry};
pub use descriptor::{ChecksumAlgorithm, ContentDescriptor};
pub use engine::{ContentResolver, DownloadEngine};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{ContentFetcher, DownloadRequest, Downloader, PostProcessor};
pub use progress::{DownloadProgress, ProgressObserver};
pub use queue::{DownloadQueue, Task};
pub use retry::{IsRetryable, RetryStrategy};
pub use session::{DownloadSession, SessionManager};
pub use types::{
    ContentType, DownloadResult, Priority, QueueEvent, QueueStats, SweepReport, TaskId, TaskState,
};

/// Run the engine until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Temporary files abandoned by interrupted downloads are swept afterwards.
///
/// # Example
///
/// ```no_run
/// use ripstream_dl::{Config, DownloadEngine, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = DownloadEngine::new(Config::default())?;
///     engine.start();
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: DownloadEngine) {
    wait_for_signal().await;
    engine.shutdown().await;
    let report = engine.downloader().temp_registry().sweep();
    tracing::info!(
        removed = report.removed.len(),
        retained = report.retained.len(),
        "Swept temporary files"
    );
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
