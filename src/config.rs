//! Configuration types for ripstream-dl
//!
//! All structs deserialize from JSON with per-field defaults, so a minimal
//! config file only names what it changes. Per-download behavior lives in
//! [`BehaviorSettings`]; [`SourceSettings`] overrides any of those options for a
//! single content source and adds source-scoped HTTP headers.

use crate::error::{Error, Result};
use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

/// Main configuration for the download engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Default target directory for downloads (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Staging directory for partial files (None = next to the target)
    ///
    /// Finished files are renamed into place, falling back to copy and delete
    /// when the staging directory lives on another volume.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (default: 3)
    ///
    /// Also bounds the session layer: each source allows twice this many pooled
    /// connections in total.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Maximum number of tasks the queue holds (default: 1000)
    #[serde(default = "default_queue_size_limit")]
    pub queue_size_limit: usize,

    /// Queue-level retry ceiling (default: 3)
    ///
    /// A task whose `retry_count` reaches this value stays FAILED instead of
    /// being re-queued.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    /// What happens to dependents of a task removed from the queue
    #[serde(default)]
    pub dangling_dependencies: DanglingDependencyPolicy,

    /// Verify TLS certificates (default: true)
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// User-Agent header sent with every request (default: "RipStream/1.0")
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Negotiate gzip, deflate and brotli response compression (default: true)
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Headers added to every request, before source-scoped headers
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// TCP connect timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Behavior applied when a source has no override
    #[serde(default)]
    pub default_behavior: BehaviorSettings,

    /// Per-source overrides, keyed by [`ContentDescriptor::source`](crate::descriptor::ContentDescriptor)
    #[serde(default)]
    pub source_settings: HashMap<String, SourceSettings>,

    /// Shared-path lock timing
    #[serde(default)]
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: None,
            max_concurrent_downloads: default_max_concurrent(),
            queue_size_limit: default_queue_size_limit(),
            max_task_retries: default_max_task_retries(),
            dangling_dependencies: DanglingDependencyPolicy::default(),
            verify_ssl: true,
            user_agent: default_user_agent(),
            enable_compression: true,
            custom_headers: HashMap::new(),
            connect_timeout_seconds: default_connect_timeout(),
            default_behavior: BehaviorSettings::default(),
            source_settings: HashMap::new(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Effective behavior for a source: defaults overlaid with the source's overrides
    pub fn behavior_for_source(&self, source: &str) -> BehaviorSettings {
        match self.source_settings.get(source) {
            Some(overrides) => overrides.apply_to(&self.default_behavior),
            None => self.default_behavior.clone(),
        }
    }

    /// Headers for a source: global custom headers, then the source's own
    ///
    /// Source headers win on conflict.
    pub fn headers_for_source(&self, source: &str) -> HashMap<String, String> {
        let mut headers = self.custom_headers.clone();
        if let Some(settings) = self.source_settings.get(source) {
            headers.extend(settings.headers.clone());
        }
        headers
    }

    /// Set one option for a source from a dynamic key/value pair
    ///
    /// Unknown keys and values of the wrong type are rejected with
    /// [`Error::Config`] naming the key; the existing settings are left untouched.
    pub fn set_source_option(
        &mut self,
        source: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let current = self.source_settings.get(source).cloned().unwrap_or_default();

        let mut object = match serde_json::to_value(&current)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        object.insert(key.to_string(), value);

        let updated: SourceSettings = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| Error::config(key, format!("invalid option for source '{source}': {e}")))?;

        updated
            .apply_to(&self.default_behavior)
            .validate()
            .map_err(|e| Error::config(key, e.to_string()))?;

        self.source_settings.insert(source.to_string(), updated);
        Ok(())
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads",
                "must be at least 1",
            ));
        }
        if self.queue_size_limit == 0 {
            return Err(Error::config("queue_size_limit", "must be at least 1"));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(Error::config("connect_timeout_seconds", "must be at least 1"));
        }
        if self.lock.poll_interval.is_zero() {
            return Err(Error::config("lock.poll_interval_ms", "must be greater than zero"));
        }

        self.default_behavior.validate()?;
        for source in self.source_settings.keys() {
            self.behavior_for_source(source).validate()?;
        }
        Ok(())
    }
}

/// Policy for dependents of a task that is removed from the queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanglingDependencyPolicy {
    /// Treat the removed dependency as satisfied (default)
    #[default]
    Satisfy,
    /// Fail every dependent, transitively
    FailDependents,
}

/// Per-download behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorSettings {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay formula between attempts (default: exponential)
    #[serde(default)]
    pub retry_strategy: RetryStrategy,

    /// Base delay in seconds (default: 1.0)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,

    /// Growth factor for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Upper bound on a single delay in seconds (None = uncapped)
    #[serde(default)]
    pub max_retry_delay_seconds: Option<f64>,

    /// Stretch each delay by a random 0-100% (default: false)
    #[serde(default)]
    pub retry_jitter: bool,

    /// Per-HTTP-operation timeout in seconds (default: 120)
    ///
    /// Applies to the response headers and to each body chunk separately; it
    /// never spans the whole retry loop.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Write buffer size in bytes (default: 8192)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Download even when a valid file is already present (default: false)
    #[serde(default)]
    pub overwrite_existing: bool,

    /// Require a checksum match when one is declared (default: true)
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Require a size match when one is declared (default: true)
    #[serde(default = "default_true")]
    pub verify_file_size: bool,

    /// Free space to keep on the target volume, in MiB (default: 100, None = unchecked)
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: Option<u64>,

    /// Continue partial files with a Range request after transport failures (default: true)
    #[serde(default = "default_true")]
    pub enable_resume: bool,

    /// Suffix appended to the target name for the partial file (default: ".part")
    #[serde(default = "default_temp_suffix")]
    pub temp_file_suffix: String,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_strategy: RetryStrategy::default(),
            retry_delay_seconds: default_retry_delay(),
            retry_backoff_factor: default_backoff_factor(),
            max_retry_delay_seconds: None,
            retry_jitter: false,
            timeout_seconds: default_timeout(),
            chunk_size: default_chunk_size(),
            overwrite_existing: false,
            verify_checksums: true,
            verify_file_size: true,
            min_free_space_mb: default_min_free_space_mb(),
            enable_resume: true,
            temp_file_suffix: default_temp_suffix(),
        }
    }
}

impl BehaviorSettings {
    /// Per-HTTP-operation timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Reserve required on the target volume, in bytes
    pub fn min_free_space_bytes(&self) -> Option<u64> {
        self.min_free_space_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if !self.retry_delay_seconds.is_finite() || self.retry_delay_seconds < 0.0 {
            return Err(Error::config(
                "retry_delay_seconds",
                "must be a non-negative number",
            ));
        }
        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(Error::config(
                "retry_backoff_factor",
                "must be a number greater than or equal to 1.0",
            ));
        }
        if let Some(cap) = self.max_retry_delay_seconds
            && (cap.is_nan() || cap < 0.0)
        {
            return Err(Error::config(
                "max_retry_delay_seconds",
                "must be a non-negative number",
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::config("timeout_seconds", "must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size", "must be at least 1"));
        }
        if self.temp_file_suffix.is_empty() {
            return Err(Error::config("temp_file_suffix", "must not be empty"));
        }
        Ok(())
    }
}

/// Overrides for a single content source
///
/// Every field left unset falls back to [`Config::default_behavior`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    /// Headers added to requests for this source
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Override for [`BehaviorSettings::max_retries`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Override for [`BehaviorSettings::retry_strategy`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,

    /// Override for [`BehaviorSettings::retry_delay_seconds`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<f64>,

    /// Override for [`BehaviorSettings::retry_backoff_factor`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_factor: Option<f64>,

    /// Override for [`BehaviorSettings::max_retry_delay_seconds`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_delay_seconds: Option<f64>,

    /// Override for [`BehaviorSettings::retry_jitter`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_jitter: Option<bool>,

    /// Override for [`BehaviorSettings::timeout_seconds`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Override for [`BehaviorSettings::chunk_size`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Override for [`BehaviorSettings::overwrite_existing`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_existing: Option<bool>,

    /// Override for [`BehaviorSettings::verify_checksums`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_checksums: Option<bool>,

    /// Override for [`BehaviorSettings::verify_file_size`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_file_size: Option<bool>,

    /// Override for [`BehaviorSettings::min_free_space_mb`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_space_mb: Option<u64>,

    /// Override for [`BehaviorSettings::enable_resume`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_resume: Option<bool>,

    /// Override for [`BehaviorSettings::temp_file_suffix`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_file_suffix: Option<String>,
}

impl SourceSettings {
    /// Overlay these overrides onto `base`
    pub fn apply_to(&self, base: &BehaviorSettings) -> BehaviorSettings {
        let mut merged = base.clone();
        if let Some(v) = self.max_retries {
            merged.max_retries = v;
        }
        if let Some(v) = self.retry_strategy {
            merged.retry_strategy = v;
        }
        if let Some(v) = self.retry_delay_seconds {
            merged.retry_delay_seconds = v;
        }
        if let Some(v) = self.retry_backoff_factor {
            merged.retry_backoff_factor = v;
        }
        if self.max_retry_delay_seconds.is_some() {
            merged.max_retry_delay_seconds = self.max_retry_delay_seconds;
        }
        if let Some(v) = self.retry_jitter {
            merged.retry_jitter = v;
        }
        if let Some(v) = self.timeout_seconds {
            merged.timeout_seconds = v;
        }
        if let Some(v) = self.chunk_size {
            merged.chunk_size = v;
        }
        if let Some(v) = self.overwrite_existing {
            merged.overwrite_existing = v;
        }
        if let Some(v) = self.verify_checksums {
            merged.verify_checksums = v;
        }
        if let Some(v) = self.verify_file_size {
            merged.verify_file_size = v;
        }
        if self.min_free_space_mb.is_some() {
            merged.min_free_space_mb = self.min_free_space_mb;
        }
        if let Some(v) = self.enable_resume {
            merged.enable_resume = v;
        }
        if let Some(v) = &self.temp_file_suffix {
            merged.temp_file_suffix = v.clone();
        }
        merged
    }
}

/// Timing of the cross-process shared-path lock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Delay between attempts to create the lock directory (default: 100ms)
    #[serde(
        rename = "poll_interval_ms",
        default = "default_lock_poll_interval",
        with = "duration_millis_serde"
    )]
    pub poll_interval: Duration,

    /// Age after which an existing lock directory is considered abandoned (default: 300s)
    #[serde(
        rename = "stale_after_seconds",
        default = "default_lock_stale_after",
        with = "duration_serde"
    )]
    pub stale_after: Duration,

    /// How long to wait before bypassing a held lock (default: 30s)
    #[serde(
        rename = "acquire_timeout_seconds",
        default = "default_lock_acquire_timeout",
        with = "duration_serde"
    )]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_lock_poll_interval(),
            stale_after: default_lock_stale_after(),
            acquire_timeout: default_lock_acquire_timeout(),
        }
    }
}

// Default value functions
fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_queue_size_limit() -> usize {
    1000
}

fn default_max_task_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    "RipStream/1.0".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_timeout() -> u64 {
    120
}

fn default_chunk_size() -> usize {
    8192
}

fn default_min_free_space_mb() -> Option<u64> {
    Some(100)
}

fn default_temp_suffix() -> String {
    ".part".to_string()
}

fn default_lock_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_lock_stale_after() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.queue_size_limit, 1000);
        assert_eq!(config.user_agent, "RipStream/1.0");
        assert!(config.verify_ssl);
        assert_eq!(config.default_behavior, BehaviorSettings::default());
        assert_eq!(config.lock.poll_interval, Duration::from_millis(100));
        assert_eq!(
            config.dangling_dependencies,
            DanglingDependencyPolicy::Satisfy
        );
    }

    #[test]
    fn behavior_defaults_match_documented_values() {
        let b = BehaviorSettings::default();
        assert_eq!(b.max_retries, 3);
        assert_eq!(b.retry_strategy, RetryStrategy::Exponential);
        assert_eq!(b.retry_delay_seconds, 1.0);
        assert_eq!(b.retry_backoff_factor, 2.0);
        assert_eq!(b.timeout_seconds, 120);
        assert_eq!(b.chunk_size, 8192);
        assert_eq!(b.min_free_space_mb, Some(100));
        assert_eq!(b.min_free_space_bytes(), Some(100 * 1024 * 1024));
        assert!(!b.overwrite_existing);
        assert!(b.verify_checksums && b.verify_file_size);
    }

    #[test]
    fn unknown_behavior_key_is_rejected() {
        let err = Config::from_json_str(r#"{"default_behavior": {"max_retires": 5}}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "got {err:?}");
    }

    #[test]
    fn source_overrides_overlay_defaults() {
        let config = Config::from_json_str(
            r#"{
                "custom_headers": {"X-App": "ripstream", "X-Shared": "global"},
                "source_settings": {
                    "qobuz": {
                        "headers": {"X-Shared": "qobuz"},
                        "max_retries": 7,
                        "retry_strategy": "linear"
                    }
                }
            }"#,
        )
        .unwrap();

        let qobuz = config.behavior_for_source("qobuz");
        assert_eq!(qobuz.max_retries, 7);
        assert_eq!(qobuz.retry_strategy, RetryStrategy::Linear);
        assert_eq!(qobuz.chunk_size, 8192);

        let other = config.behavior_for_source("tidal");
        assert_eq!(other, config.default_behavior);

        let headers = config.headers_for_source("qobuz");
        assert_eq!(headers["X-App"], "ripstream");
        assert_eq!(headers["X-Shared"], "qobuz");
        assert_eq!(config.headers_for_source("tidal")["X-Shared"], "global");
    }

    #[test]
    fn set_source_option_applies_known_key() {
        let mut config = Config::default();
        config
            .set_source_option("deezer", "overwrite_existing", json!(true))
            .unwrap();
        config
            .set_source_option("deezer", "retry_strategy", json!("fixed"))
            .unwrap();

        let behavior = config.behavior_for_source("deezer");
        assert!(behavior.overwrite_existing);
        assert_eq!(behavior.retry_strategy, RetryStrategy::Fixed);
    }

    #[test]
    fn set_source_option_rejects_unknown_key() {
        let mut config = Config::default();
        let err = config
            .set_source_option("deezer", "make_it_fast", json!(true))
            .unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("make_it_fast")),
            other => panic!("expected config error, got {other:?}"),
        }
        assert!(!config.source_settings.contains_key("deezer"));
    }

    #[test]
    fn set_source_option_rejects_wrong_type_and_invalid_value() {
        let mut config = Config::default();
        assert!(
            config
                .set_source_option("deezer", "max_retries", json!("three"))
                .is_err()
        );
        assert!(
            config
                .set_source_option("deezer", "retry_backoff_factor", json!(0.5))
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_programmer_errors() {
        let mut config = Config {
            max_concurrent_downloads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_concurrent_downloads = 2;
        config.default_behavior.retry_delay_seconds = -1.0;
        assert!(config.validate().is_err());

        config.default_behavior.retry_delay_seconds = f64::NAN;
        assert!(config.validate().is_err());

        config.default_behavior.retry_delay_seconds = 1.0;
        config.default_behavior.chunk_size = 0;
        assert!(config.validate().is_err());

        config.default_behavior.chunk_size = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lock_timings_use_named_units() {
        let config = Config::from_json_str(
            r#"{"lock": {"poll_interval_ms": 25, "stale_after_seconds": 60, "acquire_timeout_seconds": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.lock.poll_interval, Duration::from_millis(25));
        assert_eq!(config.lock.stale_after, Duration::from_secs(60));
        assert_eq!(config.lock.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_concurrent_downloads": 8}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_downloads, 8);
    }
}
