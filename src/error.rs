//! Error types for ripstream-dl
//!
//! This module provides the error taxonomy used throughout the library:
//! - Transfer classifications derived from HTTP status codes (authentication,
//!   not found, permission, rate limit, network)
//! - Local failures (insufficient storage, checksum and size mismatches)
//! - Scheduler and configuration errors raised to the caller
//!
//! Errors raised inside a single download attempt never escape the pipeline;
//! they are converted into a retry decision or a failed [`DownloadResult`].
//! Only programmer errors (invalid configuration) propagate as `Err`.
//!
//! [`DownloadResult`]: crate::types::DownloadResult

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{TaskId, TaskState};

/// Result type alias for ripstream-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ripstream-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_retries")
        key: Option<String>,
    },

    /// 401-class response or an explicit authentication failure upstream
    #[error("authentication failed: HTTP {status} for {url}")]
    Authentication {
        /// The status code returned by the server
        status: u16,
        /// The requested URL
        url: String,
    },

    /// 404-class response
    #[error("content not found: HTTP {status} for {url}")]
    ContentNotFound {
        /// The status code returned by the server
        status: u16,
        /// The requested URL
        url: String,
    },

    /// 403-class response
    #[error("access forbidden: HTTP {status} for {url}")]
    Permission {
        /// The status code returned by the server
        status: u16,
        /// The requested URL
        url: String,
    },

    /// 429-class response
    #[error("rate limit exceeded for {url}")]
    RateLimited {
        /// The requested URL
        url: String,
        /// Delay requested by the server through the `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// 5xx responses and any other unclassified non-2xx status
    #[error("network error: {message}")]
    Network {
        /// Human-readable description
        message: String,
        /// The status code, when the failure came from a response
        status: Option<u16>,
    },

    /// Transport-level failure from the HTTP client (connect, timeout, body read)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Free space on the target volume is below the configured threshold
    #[error("insufficient storage: need {required} bytes, have {available} bytes")]
    InsufficientStorage {
        /// Number of bytes required (expected size plus the free-space reserve)
        required: u64,
        /// Number of bytes currently available on the volume
        available: u64,
    },

    /// The downloaded file does not hash to the declared checksum
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The file that was validated
        path: PathBuf,
        /// The declared checksum
        expected: String,
        /// The computed checksum
        actual: String,
    },

    /// The downloaded file does not have the declared length
    #[error("file size mismatch for {path}: expected {expected} bytes, got {actual} bytes")]
    FileSizeMismatch {
        /// The file that was validated
        path: PathBuf,
        /// The declared size in bytes
        expected: u64,
        /// The actual size in bytes
        actual: u64,
    },

    /// Catch-all wrapping an underlying cause with context
    #[error("download error: {context}: {source}")]
    Download {
        /// What was being done when the error occurred
        context: String,
        /// The underlying cause
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The transfer was cancelled cooperatively
    #[error("download cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue is at capacity
    #[error("queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// No task with this id is held by the queue
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// A task with this id is already held by the queue
    #[error("task {0} is already queued")]
    DuplicateTask(TaskId),

    /// The requested state transition is not allowed from the task's current state
    #[error("cannot {operation} task {id} in state {state}")]
    InvalidTransition {
        /// The task id
        id: TaskId,
        /// The attempted operation (e.g. "complete", "fail", "cancel")
        operation: &'static str,
        /// The state that prevents the transition
        state: TaskState,
    },
}

impl Error {
    /// Create a configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Wrap an arbitrary cause with context
    pub fn download<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Download {
            context: context.into(),
            source: source.into(),
        }
    }

    /// The classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::ContentNotFound { .. } => ErrorKind::ContentNotFound,
            Error::Permission { .. } => ErrorKind::Permission,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Network { .. } | Error::Http(_) => ErrorKind::Network,
            Error::InsufficientStorage { .. } => ErrorKind::InsufficientStorage,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::FileSizeMismatch { .. } => ErrorKind::FileSizeMismatch,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config { .. } => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Download { .. }
            | Error::Serialization(_)
            | Error::QueueFull { .. }
            | Error::TaskNotFound(_)
            | Error::DuplicateTask(_)
            | Error::InvalidTransition { .. } => ErrorKind::Download,
        }
    }

    /// Server-provided delay hint carried by rate-limit errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Machine-readable classification of a failure
///
/// Stored on [`DownloadResult`](crate::types::DownloadResult) so consumers can branch
/// on the failure class without holding the error value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401-class
    Authentication,
    /// 404-class
    ContentNotFound,
    /// 403-class
    Permission,
    /// 429-class
    RateLimited,
    /// Transport failures, 5xx and unclassified statuses
    Network,
    /// Preflight free-space check failed
    InsufficientStorage,
    /// Post-validation checksum failure
    ChecksumMismatch,
    /// Post-validation size failure
    FileSizeMismatch,
    /// Cooperative cancellation
    Cancelled,
    /// Invalid configuration
    Config,
    /// Local filesystem failure
    Io,
    /// Anything else
    Download,
}

impl ErrorKind {
    /// Whether a failure of this class is worth another attempt
    ///
    /// Authentication, not-found, permission, storage, cancellation and
    /// configuration failures will not change by trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::ChecksumMismatch
                | ErrorKind::FileSizeMismatch
                | ErrorKind::Io
                | ErrorKind::Download
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::ContentNotFound => "content_not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::InsufficientStorage => "insufficient_storage",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::FileSizeMismatch => "file_size_mismatch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Download => "download",
        };
        f.write_str(s)
    }
}
