//! Core types for ripstream-dl

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorKind;

/// Process-wide counter backing [`TaskId::next`]
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque unique identifier for a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate a new id, unique within this process
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Type of downloadable content
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// A single audio track
    Track,
    /// A whole album
    Album,
    /// A playlist
    Playlist,
    /// Cover art or another image shared by several items
    Artwork,
    /// A metadata sidecar
    Metadata,
    /// An artist discography
    Artist,
    /// Anything else
    #[default]
    Unknown,
}

impl ContentType {
    /// Whether items of this type target a path shared with other items
    /// (one cover image per album folder), requiring the resource coordinator
    pub fn is_shared_asset(&self) -> bool {
        matches!(self, ContentType::Artwork)
    }
}

/// Task priority (higher is served first)
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority
    Low = 1,
    /// Normal priority
    #[default]
    Normal = 2,
    /// High priority
    High = 3,
    /// Served before everything else
    Urgent = 4,
}

/// Task lifecycle state
///
/// ```text
/// PENDING -> DOWNLOADING -> COMPLETED
///                        -> FAILED -> PENDING (retry) | FAILED (exhausted)
/// PENDING | DOWNLOADING  -> CANCELLED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to be served (initial state)
    Pending,
    /// Handed to a worker
    Downloading,
    /// Finished successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Cancelled by the owner
    Cancelled,
}

impl TaskState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Downloading => "downloading",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one pipeline invocation
///
/// Owned by the caller that invoked the pipeline; the queue never retains it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadResult {
    /// The task this result belongs to
    pub task_id: TaskId,

    /// Whether the download succeeded
    pub success: bool,

    /// Path of the finished file
    pub file_path: Option<PathBuf>,

    /// Size of the finished file in bytes
    pub file_size_bytes: Option<u64>,

    /// Hex digest of the finished file (declared algorithm)
    pub checksum: Option<String>,

    /// Wall time spent, including retries and backoff
    pub duration_seconds: f64,

    /// Average throughput over the whole call
    pub average_speed_bps: Option<f64>,

    /// Human-readable failure description
    pub error_message: Option<String>,

    /// Classification of the failure
    pub error_kind: Option<ErrorKind>,

    /// Whether the failure could clear up on a later attempt
    #[serde(default)]
    pub retryable: bool,

    /// Number of retries performed (attempts minus one)
    pub retry_count: u32,

    /// Free-form extra information (e.g. `skipped`, `reason`)
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DownloadResult {
    /// Whether the result points at a file that exists on disk
    pub fn has_file(&self) -> bool {
        self.file_path.as_ref().is_some_and(|p| p.exists())
    }

    /// Whether the pipeline short-circuited because the file was already present
    pub fn was_skipped(&self) -> bool {
        self.metadata
            .get("skipped")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Average speed as a human-readable string ("Unknown" when not measured)
    pub fn formatted_speed(&self) -> String {
        match self.average_speed_bps {
            Some(speed) if speed > 0.0 => crate::utils::format_speed(speed),
            _ => "Unknown".to_string(),
        }
    }

    /// File size as a human-readable string ("Unknown" when not known)
    pub fn formatted_size(&self) -> String {
        match self.file_size_bytes {
            Some(size) if size > 0 => crate::utils::format_bytes(size),
            _ => "Unknown".to_string(),
        }
    }
}

/// Queue statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total number of tasks held
    pub total: usize,

    /// Tasks in PENDING (ready or waiting on dependencies)
    pub pending: usize,

    /// PENDING tasks with no unmet dependencies
    pub ready: usize,

    /// PENDING tasks withheld because of unmet dependencies
    pub deferred: usize,

    /// Tasks handed to workers
    pub downloading: usize,

    /// Completed tasks
    pub completed: usize,

    /// Failed tasks with no retries left
    pub failed: usize,

    /// Cancelled tasks
    pub cancelled: usize,

    /// Configured capacity
    pub capacity: usize,

    /// `total / capacity` as a percentage
    pub utilization_percent: f64,
}

/// Event emitted by the queue after each state mutation
///
/// Delivered over a broadcast channel; sent after the queue's critical section
/// is released but before the mutating call returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Task accepted by the queue
    TaskAdded {
        /// Task id
        id: TaskId,
        /// Whether the task was withheld because of unmet dependencies
        deferred: bool,
    },

    /// Task handed to a worker
    TaskStarted {
        /// Task id
        id: TaskId,
    },

    /// Task's last dependency completed; it is now ready
    TaskPromoted {
        /// Task id
        id: TaskId,
    },

    /// Task completed
    TaskCompleted {
        /// Task id
        id: TaskId,
    },

    /// Task failed
    TaskFailed {
        /// Task id
        id: TaskId,
        /// Error message
        error: String,
        /// Whether the task went back to PENDING for another attempt
        will_retry: bool,
    },

    /// Task cancelled
    TaskCancelled {
        /// Task id
        id: TaskId,
    },

    /// Task evicted from the queue
    TaskRemoved {
        /// Task id
        id: TaskId,
    },
}

/// Outcome of a temp-registry sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Paths deleted during this pass
    pub removed: Vec<PathBuf>,

    /// Paths that could not be deleted and stay registered for the next pass
    pub retained: Vec<PathBuf>,
}
