//! Test configuration helpers for building engines against a local mock server

use ripstream_dl::{BehaviorSettings, Config, DownloadEngine, Downloader, TempRegistry};
use std::sync::Arc;
use tempfile::TempDir;

/// Behavior with no retry delay and no free-space reserve
pub fn fast_behavior() -> BehaviorSettings {
    BehaviorSettings {
        retry_delay_seconds: 0.0,
        min_free_space_mb: None,
        ..Default::default()
    }
}

/// Configuration that downloads into `dir` with fast retries
pub fn test_config(dir: &TempDir) -> Config {
    Config {
        download_dir: dir.path().join("downloads"),
        max_concurrent_downloads: 2,
        default_behavior: fast_behavior(),
        ..Default::default()
    }
}

/// Create a started engine for `config`
///
/// Each engine gets its own temp-file registry so parallel tests do not share sweeps.
pub fn create_test_engine(config: Config) -> (DownloadEngine, tokio::task::JoinHandle<()>) {
    let downloader = match Downloader::new(config) {
        Ok(d) => d.with_temp_registry(Arc::new(TempRegistry::new())),
        Err(e) => panic!("invalid test configuration: {e}"),
    };
    let engine = DownloadEngine::with_downloader(downloader);
    let handle = engine.start();
    (engine, handle)
}
