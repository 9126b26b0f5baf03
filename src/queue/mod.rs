//! Priority and dependency scheduler
//!
//! [`DownloadQueue`] holds every task by id, a priority heap of ready task ids,
//! and a deferred set of tasks waiting on dependencies. A task is ready when it
//! is PENDING and its `depends_on` set is empty. Ready tasks are served highest
//! priority first, FIFO within a priority.
//!
//! All mutations run inside one critical section. Events are broadcast after the
//! section is released and before the mutating call returns.

mod task;


pub use task::Task;

use crate::config::{Config, DanglingDependencyPolicy};
use crate::error::{Error, Result};
use crate::types::{ContentType, QueueEvent, QueueStats, TaskId, TaskState};
use chrono::Utc;
use std::collections::{BinaryHeap, HashMap, HashSet};
use task::ReadyEntry;
use tokio::sync::{Mutex, broadcast};

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<TaskId, Task>,
    ready: BinaryHeap<ReadyEntry>,
    deferred: HashSet<TaskId>,
    next_seq: u64,
}

impl QueueInner {
    /// Put a PENDING task into the ready heap or the deferred set
    ///
    /// A task keeps its enqueue position when it becomes ready; only a retry
    /// (`requeue`) moves it behind everything already waiting.
    fn schedule(&mut self, id: TaskId, requeue: bool) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.depends_on.is_empty() {
            let seq = if requeue {
                self.next_seq += 1;
                self.next_seq
            } else {
                task.enqueue_seq
            };
            task.ready_seq = Some(seq);
            self.deferred.remove(&id);
            self.ready.push(ReadyEntry {
                id,
                priority: task.priority,
                seq,
            });
        } else {
            task.ready_seq = None;
            self.deferred.insert(id);
        }
    }

    /// Drop `id` from every dependency set; returns tasks that became ready
    fn release_dependents(&mut self, id: TaskId) -> Vec<TaskId> {
        let waiting: Vec<TaskId> = self
            .tasks
            .values_mut()
            .filter_map(|t| {
                (t.depends_on.remove(&id) && t.is_ready()).then_some(t.task_id)
            })
            .collect();
        for dependent in &waiting {
            self.schedule(*dependent, false);
        }
        waiting
    }

    /// Fail every transitive dependent of `root`
    fn fail_dependents(&mut self, root: TaskId, events: &mut Vec<QueueEvent>) {
        let mut worklist = vec![root];
        while let Some(gone) = worklist.pop() {
            let dependents: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| t.depends_on.contains(&gone))
                .map(|t| t.task_id)
                .collect();

            for id in dependents {
                let Some(task) = self.tasks.get_mut(&id) else {
                    continue;
                };
                task.depends_on.remove(&gone);
                if task.state.is_terminal() {
                    continue;
                }
                let message = if gone == root {
                    format!("dependency {gone} was removed")
                } else {
                    format!("dependency {gone} failed")
                };
                task.state = TaskState::Failed;
                task.error_message = Some(message.clone());
                task.completed_at = Some(Utc::now());
                task.ready_seq = None;
                self.deferred.remove(&id);
                tracing::debug!(task_id = %id, dependency = %gone, "Failing dependent of removed task");
                events.push(QueueEvent::TaskFailed {
                    id,
                    error: message,
                    will_retry: false,
                });
                worklist.push(id);
            }
        }
    }

    /// Remove a task and apply the dangling-dependency policy
    fn remove(
        &mut self,
        id: TaskId,
        policy: DanglingDependencyPolicy,
        events: &mut Vec<QueueEvent>,
    ) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        self.deferred.remove(&id);
        events.push(QueueEvent::TaskRemoved { id });

        match policy {
            DanglingDependencyPolicy::Satisfy => {
                for promoted in self.release_dependents(id) {
                    events.push(QueueEvent::TaskPromoted { id: promoted });
                }
            }
            DanglingDependencyPolicy::FailDependents => self.fail_dependents(id, events),
        }
        Some(task)
    }
}

/// In-memory task scheduler
pub struct DownloadQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    max_task_retries: u32,
    dangling_policy: DanglingDependencyPolicy,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl DownloadQueue {
    /// Create a queue holding at most `capacity` tasks
    ///
    /// A failed task is re-queued while its `retry_count` stays below
    /// `max_task_retries`.
    pub fn new(
        capacity: usize,
        max_task_retries: u32,
        dangling_policy: DanglingDependencyPolicy,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
            max_task_retries,
            dangling_policy,
            event_tx,
        }
    }

    /// Create a queue from the engine configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.queue_size_limit,
            config.max_task_retries,
            config.dangling_dependencies,
        )
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
    }

    /// Add a task
    ///
    /// Dependencies that already completed are dropped. A task with remaining
    /// dependencies is stored but withheld from the ready heap until they complete.
    pub async fn enqueue(&self, mut task: Task) -> Result<TaskId> {
        let id = task.task_id;
        if task.depends_on.contains(&id) {
            return Err(Error::config(
                "depends_on",
                format!("task {id} cannot depend on itself"),
            ));
        }

        let deferred = {
            let mut inner = self.inner.lock().await;
            if inner.tasks.len() >= self.capacity {
                return Err(Error::QueueFull {
                    capacity: self.capacity,
                });
            }
            if inner.tasks.contains_key(&id) {
                return Err(Error::DuplicateTask(id));
            }

            task.depends_on.retain(|dep| {
                inner
                    .tasks
                    .get(dep)
                    .is_none_or(|t| t.state != TaskState::Completed)
            });
            task.state = TaskState::Pending;
            task.progress_percentage = 0.0;
            inner.next_seq += 1;
            task.enqueue_seq = inner.next_seq;
            let deferred = !task.depends_on.is_empty();

            inner.tasks.insert(id, task);
            inner.schedule(id, false);
            deferred
        };

        tracing::debug!(task_id = %id, deferred, "Task enqueued");
        self.emit(vec![QueueEvent::TaskAdded { id, deferred }]);
        Ok(id)
    }

    /// Pop the highest-priority ready task and mark it DOWNLOADING
    ///
    /// Returns a snapshot of the task, or None if nothing is ready.
    pub async fn dequeue_next(&self) -> Option<Task> {
        let task = {
            let mut inner = self.inner.lock().await;
            loop {
                let entry = inner.ready.pop()?;
                let Some(task) = inner.tasks.get_mut(&entry.id) else {
                    continue;
                };
                if task.ready_seq != Some(entry.seq) || !task.is_ready() {
                    continue;
                }
                task.ready_seq = None;
                task.state = TaskState::Downloading;
                task.started_at = Some(Utc::now());
                task.progress_percentage = 0.0;
                break task.clone();
            }
        };

        tracing::debug!(task_id = %task.task_id, priority = ?task.priority, "Task dequeued");
        self.emit(vec![QueueEvent::TaskStarted { id: task.task_id }]);
        Some(task)
    }

    /// Mark a task COMPLETED and promote dependents whose last dependency it was
    pub async fn complete(&self, id: TaskId) -> Result<()> {
        let mut events = vec![QueueEvent::TaskCompleted { id }];
        {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
            if task.state.is_terminal() {
                return Err(Error::InvalidTransition {
                    id,
                    operation: "complete",
                    state: task.state,
                });
            }
            task.state = TaskState::Completed;
            task.completed_at = Some(Utc::now());
            task.progress_percentage = 100.0;
            task.error_message = None;
            task.ready_seq = None;
            inner.deferred.remove(&id);

            for promoted in inner.release_dependents(id) {
                tracing::debug!(task_id = %promoted, dependency = %id, "Dependent promoted to ready");
                events.push(QueueEvent::TaskPromoted { id: promoted });
            }
        }

        tracing::debug!(task_id = %id, "Task completed");
        self.emit(events);
        Ok(())
    }

    /// Record a retryable failure
    ///
    /// Returns whether the task went back to PENDING for another attempt.
    pub async fn fail(&self, id: TaskId, message: impl Into<String>) -> Result<bool> {
        self.fail_with(id, message, true).await
    }

    /// Record a failure; non-retryable failures are terminal regardless of the ceiling
    pub async fn fail_with(
        &self,
        id: TaskId,
        message: impl Into<String>,
        retryable: bool,
    ) -> Result<bool> {
        let message = message.into();
        let will_retry = {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
            if task.state != TaskState::Downloading {
                return Err(Error::InvalidTransition {
                    id,
                    operation: "fail",
                    state: task.state,
                });
            }

            task.retry_count += 1;
            task.error_message = Some(message.clone());
            let will_retry = retryable && task.retry_count < self.max_task_retries;
            if will_retry {
                task.state = TaskState::Pending;
                task.progress_percentage = 0.0;
                task.started_at = None;
                inner.schedule(id, true);
            } else {
                task.state = TaskState::Failed;
                task.completed_at = Some(Utc::now());
            }
            will_retry
        };

        tracing::debug!(task_id = %id, will_retry, error = %message, "Task failed");
        self.emit(vec![QueueEvent::TaskFailed {
            id,
            error: message,
            will_retry,
        }]);
        Ok(will_retry)
    }

    /// Cancel a PENDING or DOWNLOADING task
    ///
    /// Dependents are not released; they stay deferred until the cancelled task
    /// is removed.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
            if task.state.is_terminal() {
                return Err(Error::InvalidTransition {
                    id,
                    operation: "cancel",
                    state: task.state,
                });
            }
            task.state = TaskState::Cancelled;
            task.completed_at = Some(Utc::now());
            task.ready_seq = None;
            inner.deferred.remove(&id);
        }

        tracing::debug!(task_id = %id, "Task cancelled");
        self.emit(vec![QueueEvent::TaskCancelled { id }]);
        Ok(())
    }

    /// Evict a task in any state
    ///
    /// Tasks that depended on it are handled per the configured
    /// [`DanglingDependencyPolicy`].
    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.remove(id, self.dangling_policy, &mut events)
        };
        let task = removed.ok_or(Error::TaskNotFound(id))?;

        tracing::debug!(task_id = %id, state = %task.state, "Task removed");
        self.emit(events);
        Ok(task)
    }

    /// Record progress of a DOWNLOADING task
    ///
    /// Values are clamped to 0-100 and never move backwards within an attempt.
    /// Updates for tasks in any other state are ignored.
    pub async fn update_progress(&self, id: TaskId, percentage: f32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let task = inner.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        if task.state == TaskState::Downloading && percentage.is_finite() {
            let clamped = percentage.clamp(0.0, 100.0);
            if clamped > task.progress_percentage {
                task.progress_percentage = clamped;
            }
        }
        Ok(())
    }

    /// Snapshot of one task
    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    /// Snapshots of every task in `state`, oldest first
    pub async fn tasks_by_state(&self, state: TaskState) -> Vec<Task> {
        self.collect(|t| t.state == state).await
    }

    /// Snapshots of every task of `content_type`, oldest first
    pub async fn tasks_by_content_type(&self, content_type: ContentType) -> Vec<Task> {
        self.collect(|t| t.descriptor.content_type == content_type)
            .await
    }

    /// Snapshots of every task, oldest first
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.collect(|_| true).await
    }

    async fn collect(&self, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.tasks.values().filter(|t| filter(t)).cloned().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    /// Number of tasks held
    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    /// Whether no tasks are held
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether any task is PENDING or DOWNLOADING
    pub async fn has_unfinished(&self) -> bool {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .any(|t| !t.state.is_terminal())
    }

    /// Aggregate counts and capacity utilization
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            total: inner.tasks.len(),
            capacity: self.capacity,
            ..Default::default()
        };
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Pending => {
                    stats.pending += 1;
                    if task.depends_on.is_empty() {
                        stats.ready += 1;
                    } else {
                        stats.deferred += 1;
                    }
                }
                TaskState::Downloading => stats.downloading += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }
        stats.utilization_percent = if self.capacity > 0 {
            stats.total as f64 / self.capacity as f64 * 100.0
        } else {
            0.0
        };
        stats
    }

    /// Remove COMPLETED tasks; returns how many were removed
    pub async fn clear_completed(&self) -> usize {
        self.clear_state(TaskState::Completed).await
    }

    /// Remove exhausted FAILED tasks; returns how many were removed
    pub async fn clear_failed(&self) -> usize {
        self.clear_state(TaskState::Failed).await
    }

    /// Remove CANCELLED tasks; returns how many were removed
    pub async fn clear_cancelled(&self) -> usize {
        self.clear_state(TaskState::Cancelled).await
    }

    async fn clear_state(&self, state: TaskState) -> usize {
        let mut events = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<TaskId> = inner
                .tasks
                .values()
                .filter(|t| t.state == state)
                .map(|t| t.task_id)
                .collect();
            ids.into_iter()
                .filter(|id| inner.remove(*id, self.dangling_policy, &mut events).is_some())
                .count()
        };
        tracing::debug!(state = %state, removed, "Cleared tasks");
        self.emit(events);
        removed
    }

    /// Remove every task; returns how many were removed
    pub async fn clear_all(&self) -> usize {
        let ids: Vec<TaskId> = {
            let mut inner = self.inner.lock().await;
            let ids = inner.tasks.keys().copied().collect();
            *inner = QueueInner {
                next_seq: inner.next_seq,
                ..Default::default()
            };
            ids
        };
        let removed = ids.len();
        self.emit(
            ids.into_iter()
                .map(|id| QueueEvent::TaskRemoved { id })
                .collect(),
        );
        removed
    }
}
