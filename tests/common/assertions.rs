//! Custom assertions and waiters for integration tests

use ripstream_dl::{QueueEvent, TaskId};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Result of waiting for a task to finish
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// Task completed successfully
    Completed,
    /// Task failed for good with this error
    Failed(String),
    /// Task was cancelled
    Cancelled,
    /// Timeout waiting for a terminal event
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for a task to reach a terminal state
///
/// Subscribe before enqueueing so the terminal event cannot be missed.
pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<QueueEvent>,
    id: TaskId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(QueueEvent::TaskCompleted { id: event_id }) if event_id == id => {
                    return WaitResult::Completed;
                }
                Ok(QueueEvent::TaskFailed {
                    id: event_id,
                    error,
                    will_retry: false,
                }) if event_id == id => {
                    return WaitResult::Failed(error);
                }
                Ok(QueueEvent::TaskCancelled { id: event_id }) if event_id == id => {
                    return WaitResult::Cancelled;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

/// Collect events until `stop_predicate` matches or the timeout expires
pub async fn collect_events_until<F>(
    events: &mut broadcast::Receiver<QueueEvent>,
    timeout: Duration,
    stop_predicate: F,
) -> Vec<QueueEvent>
where
    F: Fn(&QueueEvent) -> bool,
{
    let mut collected = Vec::new();

    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let should_stop = stop_predicate(&event);
            collected.push(event);
            if should_stop {
                break;
            }
        }
    })
    .await;

    collected
}

/// Assert that a file exists with exactly `expected` as content
pub fn assert_file_content(path: &Path, expected: &[u8]) {
    match std::fs::read(path) {
        Ok(content) => assert_eq!(
            content,
            expected,
            "unexpected content in {}",
            path.display()
        ),
        Err(e) => panic!("expected file {} to exist: {e}", path.display()),
    }
}

/// Assert that no partial or temporary files remain in `dir`
pub fn assert_no_leftovers(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    let name = p.to_string_lossy();
                    name.ends_with(".part") || name.ends_with(".tmp") || name.ends_with(".lock")
                })
                .collect()
        })
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}
