//! Task model

use crate::descriptor::ContentDescriptor;
use crate::types::{Priority, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// One unit of scheduled work: a descriptor plus scheduling state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique id
    pub task_id: TaskId,

    /// What to download
    pub descriptor: ContentDescriptor,

    /// Scheduling priority
    pub priority: Priority,

    /// Lifecycle state
    pub state: TaskState,

    /// Tasks that must complete before this one becomes ready
    pub depends_on: HashSet<TaskId>,

    /// Failures so far
    pub retry_count: u32,

    /// Progress of the current attempt (0-100)
    pub progress_percentage: f32,

    /// Message of the most recent failure
    pub error_message: Option<String>,

    /// Directory to download into (None = the configured download directory)
    pub target_dir: Option<PathBuf>,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the current or last attempt started
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Position in enqueue order; ties between equal priorities go to the lower value
    #[serde(skip)]
    pub(crate) enqueue_seq: u64,

    /// Sequence of the live ready-heap entry
    #[serde(skip)]
    pub(crate) ready_seq: Option<u64>,
}

impl Task {
    /// Create a PENDING task with a fresh id and normal priority
    pub fn new(descriptor: ContentDescriptor) -> Self {
        Self {
            task_id: TaskId::next(),
            descriptor,
            priority: Priority::default(),
            state: TaskState::Pending,
            depends_on: HashSet::new(),
            retry_count: 0,
            progress_percentage: 0.0,
            error_message: None,
            target_dir: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            enqueue_seq: 0,
            ready_seq: None,
        }
    }

    /// Builder: set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add dependencies
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    /// Builder: download into `dir` instead of the configured directory
    pub fn with_target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    /// PENDING with no unmet dependencies
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Pending && self.depends_on.is_empty()
    }

    /// Time from start to completion, when both are known
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// Entry in the ready heap
///
/// Entries are invalidated lazily: an entry whose `seq` no longer matches the
/// task's `ready_seq` is skipped when popped.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ReadyEntry {
    pub(crate) id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
}

// Implement Ord for BinaryHeap (max-heap by default)
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            // Equal priority: lower seq wins
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
