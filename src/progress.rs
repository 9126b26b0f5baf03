//! Progress reporting
//!
//! The pipeline reports cumulative byte counts to a [`ProgressObserver`] on
//! every chunk. Observers must not panic; if one does, the panic is caught and
//! logged and the transfer continues.

use crate::types::TaskId;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Receives cumulative progress for a transfer
pub trait ProgressObserver: Send + Sync {
    /// Called on every chunk with the bytes written so far and the total when known
    fn on_progress(&self, task_id: TaskId, downloaded: u64, total: Option<u64>);
}

impl<F> ProgressObserver for F
where
    F: Fn(TaskId, u64, Option<u64>) + Send + Sync,
{
    fn on_progress(&self, task_id: TaskId, downloaded: u64, total: Option<u64>) {
        self(task_id, downloaded, total)
    }
}

/// Shared observer handle
pub type SharedObserver = Arc<dyn ProgressObserver>;

/// Invoke an observer, isolating the caller from its panics
///
/// Returns false when the observer panicked.
pub fn notify(
    observer: &dyn ProgressObserver,
    task_id: TaskId,
    downloaded: u64,
    total: Option<u64>,
) -> bool {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        observer.on_progress(task_id, downloaded, total)
    }));
    if outcome.is_err() {
        tracing::warn!(
            task_id = %task_id,
            downloaded,
            "Progress observer panicked; continuing transfer"
        );
        return false;
    }
    true
}

/// Minimum window for the instantaneous speed sample
const SPEED_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Speed, percentage and ETA tracker for one transfer
#[derive(Clone, Debug)]
pub struct DownloadProgress {
    started: Instant,
    downloaded: u64,
    total: Option<u64>,
    sample_started: Instant,
    sample_bytes: u64,
    current_speed: f64,
}

impl DownloadProgress {
    /// Start tracking a transfer of `total` bytes (when known)
    pub fn new(total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            downloaded: 0,
            total,
            sample_started: now,
            sample_bytes: 0,
            current_speed: 0.0,
        }
    }

    /// Set the starting offset when resuming a partial file
    pub fn resume_from(&mut self, offset: u64) {
        self.downloaded = offset;
        self.sample_bytes = offset;
    }

    /// Update the total once the server reports it
    pub fn set_total(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.total = total;
        }
    }

    /// Record `bytes` more bytes written
    pub fn advance(&mut self, bytes: u64) {
        self.downloaded = self.downloaded.saturating_add(bytes);
        let elapsed = self.sample_started.elapsed();
        if elapsed >= SPEED_SAMPLE_WINDOW {
            let delta = self.downloaded.saturating_sub(self.sample_bytes);
            self.current_speed = delta as f64 / elapsed.as_secs_f64();
            self.sample_started = Instant::now();
            self.sample_bytes = self.downloaded;
        }
    }

    /// Bytes written so far
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Total bytes, when known
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Completion percentage (0-100), when the total is known
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some(((self.downloaded as f64 / total as f64) * 100.0).min(100.0) as f32),
            None => None,
        }
    }

    /// Speed over the most recent sample window, in bytes per second
    pub fn current_speed_bps(&self) -> f64 {
        self.current_speed
    }

    /// Speed since tracking started, in bytes per second
    pub fn average_speed_bps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.downloaded as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time remaining, when the total and a speed are known
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let speed = if self.current_speed > 0.0 {
            self.current_speed
        } else {
            self.average_speed_bps()
        };
        if speed <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.downloaded) as f64;
        Duration::try_from_secs_f64(remaining / speed).ok()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closure_observer_receives_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = move |id: TaskId, done: u64, total: Option<u64>| {
            sink.lock().unwrap().push((id, done, total));
        };
        assert!(notify(&observer, TaskId(3), 10, Some(20)));
        assert_eq!(seen.lock().unwrap()[0], (TaskId(3), 10, Some(20)));
    }

    struct PanickyObserver;

    impl ProgressObserver for PanickyObserver {
        fn on_progress(&self, _task_id: TaskId, _downloaded: u64, _total: Option<u64>) {
            panic!("observer bug");
        }
    }

    #[test]
    fn panicking_observer_is_isolated() {
        assert!(!notify(&PanickyObserver, TaskId(1), 1, None));
    }

    #[test]
    fn percentage_and_resume() {
        let mut p = DownloadProgress::new(Some(200));
        p.resume_from(50);
        p.advance(50);
        assert_eq!(p.downloaded(), 100);
        assert_eq!(p.percentage(), Some(50.0));

        let unknown = DownloadProgress::new(None);
        assert_eq!(unknown.percentage(), None);
        assert_eq!(unknown.eta(), None);
    }

    #[test]
    fn percentage_never_exceeds_100() {
        let mut p = DownloadProgress::new(Some(10));
        p.advance(25);
        assert_eq!(p.percentage(), Some(100.0));
    }
}
