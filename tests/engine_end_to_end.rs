//! End-to-end tests for the engine against a local HTTP server
//!
//! These tests drive the full stack (queue, worker pool, pipeline and session
//! layer) through wiremock; no external network access is needed.

mod common;

use common::{
    TRACK_BODY, TRACK_MD5, WaitResult, assert_file_content, assert_no_leftovers,
    collect_events_until, create_test_engine, fast_behavior, serve_body, serve_status,
    test_config, track, wait_for_terminal,
};
use ripstream_dl::{
    BehaviorSettings, ChecksumAlgorithm, Config, ContentType, DownloadRequest, Downloader,
    ErrorKind, Priority, QueueEvent, Task, TaskState,
};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn album_with_cover_and_a_missing_track() {
    let server = MockServer::start().await;
    serve_body(&server, "01", TRACK_BODY).await;
    serve_body(&server, "02", TRACK_BODY).await;
    serve_status(&server, "03", 404).await;
    serve_body(&server, "cover", b"jpeg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let album_dir = config.download_dir.join("Artist - Album");
    let (engine, handle) = create_test_engine(config);
    let mut events = engine.subscribe();

    let cover = Task::new(
        track(&server, "cover").with_content_type(ContentType::Artwork),
    )
    .with_priority(Priority::High)
    .with_target_dir(&album_dir);
    let cover_id = engine.enqueue(cover).await.unwrap();

    let mut track_ids = Vec::new();
    for name in ["01", "02", "03"] {
        let descriptor = track(&server, name).with_checksum(ChecksumAlgorithm::Md5, TRACK_MD5);
        let task = Task::new(descriptor)
            .depends_on([cover_id])
            .with_target_dir(&album_dir);
        track_ids.push(engine.enqueue(task).await.unwrap());
    }

    match wait_for_terminal(&mut events, track_ids[2], WAIT).await {
        WaitResult::Failed(error) => assert!(error.contains("HTTP 404"), "{error}"),
        other => panic!("expected the missing track to fail, got {other:?}"),
    }
    tokio::time::timeout(WAIT, engine.wait_idle()).await.unwrap();

    let stats = engine.queue().stats().await;
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);

    assert_file_content(&album_dir.join("cover.flac"), b"jpeg");
    assert_file_content(&album_dir.join("01.flac"), TRACK_BODY);
    assert_file_content(&album_dir.join("02.flac"), TRACK_BODY);
    assert!(!album_dir.join("03.flac").exists());
    assert_no_leftovers(&album_dir);

    assert_eq!(engine.queue().clear_completed().await, 3);
    assert_eq!(engine.queue().len().await, 1);

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn task_lifecycle_events_arrive_in_order() {
    let server = MockServer::start().await;
    serve_body(&server, "a", TRACK_BODY).await;

    let dir = TempDir::new().unwrap();
    let (engine, handle) = create_test_engine(test_config(&dir));
    let mut events = engine.subscribe();

    let id = engine.enqueue(Task::new(track(&server, "a"))).await.unwrap();
    let collected = collect_events_until(&mut events, WAIT, |e| {
        matches!(e, QueueEvent::TaskCompleted { .. })
    })
    .await;

    assert_eq!(
        collected,
        vec![
            QueueEvent::TaskAdded {
                id,
                deferred: false
            },
            QueueEvent::TaskStarted { id },
            QueueEvent::TaskCompleted { id },
        ]
    );
    let task = engine.queue().get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert!(task.duration().is_some());

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn per_source_settings_apply_to_their_descriptors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_task_retries = 1;
    config
        .set_source_option("qobuz", "max_retries", serde_json::json!(1))
        .unwrap();
    let (engine, handle) = create_test_engine(config);
    let mut events = engine.subscribe();

    let id = engine
        .enqueue(Task::new(track(&server, "flaky")))
        .await
        .unwrap();

    match wait_for_terminal(&mut events, id, WAIT).await {
        WaitResult::Failed(error) => assert!(error.contains("500"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn resumes_a_partial_file_with_a_range_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/song"))
        .and(header("range", "bytes=3-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 3-4/5")
                .set_body_bytes(b"lo".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("song.flac.part"), b"hel").unwrap();
    let downloader = Downloader::new(Config {
        default_behavior: fast_behavior(),
        ..Default::default()
    })
    .unwrap();

    let descriptor = track(&server, "song").with_checksum(ChecksumAlgorithm::Md5, TRACK_MD5);
    let result = downloader.download(&descriptor, dir.path()).await.unwrap();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.checksum.as_deref(), Some(TRACK_MD5));
    assert_file_content(&dir.path().join("song.flac"), TRACK_BODY);
    assert_no_leftovers(dir.path());
}

#[tokio::test]
async fn checksum_mismatch_over_http_leaves_nothing_behind() {
    let server = MockServer::start().await;
    serve_body(&server, "bad", b"wrong").await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(Config::default()).unwrap();
    let request = DownloadRequest::new(
        track(&server, "bad").with_checksum(ChecksumAlgorithm::Md5, TRACK_MD5),
        dir.path(),
    )
    .with_settings(BehaviorSettings {
        max_retries: 1,
        ..fast_behavior()
    });

    let result = downloader.download_with(request).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ChecksumMismatch));
    assert_eq!(result.retry_count, 1);
    assert!(!dir.path().join("bad.flac").exists());
    assert_no_leftovers(dir.path());
}

#[tokio::test]
async fn second_run_skips_what_is_already_on_disk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(TRACK_BODY.to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new(Config {
        default_behavior: fast_behavior(),
        ..Default::default()
    })
    .unwrap();
    let descriptor = track(&server, "a").with_checksum(ChecksumAlgorithm::Md5, TRACK_MD5);

    let first = downloader.download(&descriptor, dir.path()).await.unwrap();
    let second = downloader.download(&descriptor, dir.path()).await.unwrap();

    assert!(first.success && !first.was_skipped());
    assert!(second.success && second.was_skipped());
    assert_eq!(second.formatted_size(), "5 B");
}
