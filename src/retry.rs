//! Retry delay policy
//!
//! This module computes how long to wait between download attempts. The
//! strategy is selected per download through
//! [`BehaviorSettings::retry_strategy`](crate::config::BehaviorSettings):
//!
//! | strategy      | delay before attempt `n + 1`        |
//! |---------------|-------------------------------------|
//! | `none`        | `0`                                 |
//! | `fixed`       | `base`                              |
//! | `linear`      | `base * (n + 1)`                    |
//! | `exponential` | `base * backoff_factor ^ n`         |
//!
//! `n` is the zero-based index of the attempt that just failed. A rate-limit
//! response carrying a `Retry-After` hint overrides the formula.
//!
//! # Example
//!
//! ```
//! use ripstream_dl::config::BehaviorSettings;
//! use ripstream_dl::retry::{RetryStrategy, retry_delay};
//! use std::time::Duration;
//!
//! let settings = BehaviorSettings {
//!     retry_strategy: RetryStrategy::Linear,
//!     retry_delay_seconds: 1.0,
//!     ..Default::default()
//! };
//! assert_eq!(retry_delay(&settings, 2), Duration::from_secs(3));
//! ```

use crate::config::BehaviorSettings;
use crate::error::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest server `Retry-After` hint honored when no cap is configured
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Delay formula applied between attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately
    None,
    /// Constant delay
    #[serde(alias = "fixed_delay")]
    Fixed,
    /// Delay grows linearly with the attempt index
    Linear,
    /// Delay grows geometrically with the attempt index
    #[default]
    Exponential,
}

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, rate limits, corrupt transfers) return `true`.
/// Permanent failures (authentication, missing content, storage) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Connection and timeout failures are transient; builder or decode errors are not
            Error::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Error::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::ReadOnlyFilesystem
                    | std::io::ErrorKind::StorageFull
            ),
            other => other.kind().is_retryable(),
        }
    }
}

/// Delay before the attempt following zero-based attempt `attempt`
///
/// Applies the configured strategy, then the optional cap, then optional jitter.
pub fn retry_delay(settings: &BehaviorSettings, attempt: u32) -> Duration {
    let base = settings.retry_delay_seconds.max(0.0);
    let secs = match settings.retry_strategy {
        RetryStrategy::None => 0.0,
        RetryStrategy::Fixed => base,
        RetryStrategy::Linear => base * f64::from(attempt + 1),
        RetryStrategy::Exponential => {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            base * settings.retry_backoff_factor.powi(exponent)
        }
    };

    let capped = match settings.max_retry_delay_seconds {
        Some(cap) => secs.min(cap.max(0.0)),
        None => secs,
    };

    let delay = duration_from_secs(capped);
    if settings.retry_jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Delay before the next attempt after `error`, honoring a server `Retry-After` hint
///
/// The hint is bounded by `max_retry_delay_seconds`, or by [`MAX_RETRY_AFTER`]
/// when that is unset.
pub fn next_delay(settings: &BehaviorSettings, attempt: u32, error: &Error) -> Duration {
    match error.retry_after() {
        Some(hint) => {
            let cap = settings
                .max_retry_delay_seconds
                .map_or(MAX_RETRY_AFTER, duration_from_secs);
            let delay = hint.min(cap);
            tracing::debug!(
                retry_after_secs = hint.as_secs_f64(),
                delay_secs = delay.as_secs_f64(),
                "Honoring server Retry-After hint"
            );
            delay
        }
        None => retry_delay(settings, attempt),
    }
}

/// Convert seconds to a Duration, saturating on overflow and treating NaN as zero
fn duration_from_secs(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        if secs.is_infinite() && secs > 0.0 {
            return Duration::MAX;
        }
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    duration_from_secs(delay.as_secs_f64() * (1.0 + jitter_factor))
}
