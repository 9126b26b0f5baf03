use super::*;
use crate::config::BehaviorSettings;
use crate::coordinator::TempRegistry;
use crate::pipeline::{ByteStream, ContentFetcher};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// --- helpers ---

fn test_config(dir: &TempDir) -> Config {
    Config {
        download_dir: dir.path().to_path_buf(),
        default_behavior: BehaviorSettings {
            retry_delay_seconds: 0.0,
            min_free_space_mb: None,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine_with(config: Config) -> DownloadEngine {
    let downloader = Downloader::new(config)
        .unwrap()
        .with_temp_registry(Arc::new(TempRegistry::new()));
    DownloadEngine::with_downloader(downloader)
}

fn descriptor(server: &MockServer, name: &str) -> ContentDescriptor {
    ContentDescriptor::new(
        name,
        "qobuz",
        format!("{}/{name}", server.uri()),
        name,
        "flac",
    )
}

async fn serve(server: &MockServer, name: &str, body: &'static [u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn wait_idle(engine: &DownloadEngine) {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
        .await
        .expect("engine did not go idle");
}

async fn wait_for_state(engine: &DownloadEngine, id: TaskId, state: TaskState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while engine.queue().get(id).await.map(|t| t.state) != Some(state) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never reached the expected state");
}

fn completion_order(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<TaskId> {
    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::TaskCompleted { id } = event {
            order.push(id);
        }
    }
    order
}

// --- processing ---

#[tokio::test]
async fn processes_queued_tasks_to_completion() {
    let server = MockServer::start().await;
    for name in ["a", "b", "c"] {
        serve(&server, name, b"hello").await;
    }
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let handle = engine.start();

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(
            engine
                .enqueue(Task::new(descriptor(&server, name)))
                .await
                .unwrap(),
        );
    }
    wait_idle(&engine).await;

    for id in ids {
        let task = engine.queue().get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.progress_percentage, 100.0);
    }
    for name in ["a", "b", "c"] {
        assert_eq!(
            std::fs::read(dir.path().join(format!("{name}.flac"))).unwrap(),
            b"hello"
        );
    }

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn task_target_dir_overrides_download_dir() {
    let server = MockServer::start().await;
    serve(&server, "a", b"hello").await;
    let dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let handle = engine.start();

    engine
        .enqueue(Task::new(descriptor(&server, "a")).with_target_dir(other.path()))
        .await
        .unwrap();
    wait_idle(&engine).await;

    assert!(other.path().join("a.flac").is_file());
    assert!(!dir.path().join("a.flac").exists());

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn higher_priority_is_served_first() {
    let server = MockServer::start().await;
    serve(&server, "low", b"hello").await;
    serve(&server, "high", b"hello").await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(Config {
        max_concurrent_downloads: 1,
        ..test_config(&dir)
    });
    let mut rx = engine.subscribe();

    // Both queued before the processor starts
    let low = engine
        .enqueue(Task::new(descriptor(&server, "low")).with_priority(Priority::Low))
        .await
        .unwrap();
    let high = engine
        .enqueue(Task::new(descriptor(&server, "high")).with_priority(Priority::High))
        .await
        .unwrap();
    let handle = engine.start();
    wait_idle(&engine).await;

    assert_eq!(completion_order(&mut rx), vec![high, low]);

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn dependents_run_after_their_dependencies() {
    let server = MockServer::start().await;
    serve(&server, "album", b"hello").await;
    serve(&server, "track", b"hello").await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let album = Task::new(descriptor(&server, "album"));
    let album_id = album.task_id;
    let track_id = engine
        .enqueue(Task::new(descriptor(&server, "track")).depends_on([album_id]))
        .await
        .unwrap();
    engine.enqueue(album).await.unwrap();
    wait_idle(&engine).await;

    assert_eq!(completion_order(&mut rx), vec![album_id, track_id]);

    engine.shutdown().await;
    handle.await.unwrap();
}

// --- failures ---

#[tokio::test]
async fn not_found_fails_without_requeue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(descriptor(&server, "gone")))
        .await
        .unwrap();
    wait_idle(&engine).await;

    let task = engine.queue().get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.retry_count, 1);
    assert!(task.error_message.unwrap().contains("404"));

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn retryable_failures_are_requeued_up_to_the_ceiling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.default_behavior.max_retries = 0;
    config.max_task_retries = 2;
    let engine = engine_with(config);
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(descriptor(&server, "flaky")))
        .await
        .unwrap();
    wait_idle(&engine).await;

    let task = engine.queue().get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.retry_count, 2);

    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::TaskFailed { will_retry, .. } = event {
            retries.push(will_retry);
        }
    }
    assert_eq!(retries, vec![true, false]);

    engine.shutdown().await;
    handle.await.unwrap();
}

struct DeniedWrites;

#[async_trait]
impl ContentFetcher for DeniedWrites {
    async fn open(
        &self,
        _descriptor: &ContentDescriptor,
        _offset: u64,
    ) -> Result<Box<dyn ByteStream>> {
        Err(Error::Io(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )))
    }
}

#[tokio::test]
async fn failures_the_pipeline_gave_up_on_are_not_requeued() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_task_retries = 3;
    let downloader = Downloader::new(config)
        .unwrap()
        .with_fetcher(Arc::new(DeniedWrites))
        .with_temp_registry(Arc::new(TempRegistry::new()));
    let engine = DownloadEngine::with_downloader(downloader);
    let mut rx = engine.subscribe();
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(ContentDescriptor::new(
            "1",
            "qobuz",
            "https://cdn.example.com/1",
            "locked",
            "flac",
        )))
        .await
        .unwrap();
    wait_idle(&engine).await;

    let task = engine.queue().get(id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.retry_count, 1);

    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::TaskFailed { will_retry, .. } = event {
            retries.push(will_retry);
        }
    }
    assert_eq!(retries, vec![false]);

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn invalid_descriptor_is_rejected_at_enqueue() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));

    let bad = ContentDescriptor::new("1", "qobuz", "ftp://example.com/x", "x", "flac");
    let err = engine.enqueue(Task::new(bad)).await.unwrap_err();

    assert!(matches!(err, Error::Config { .. }));
    assert!(engine.queue().is_empty().await);
}

// --- provider ---

struct StaticResolver {
    base: String,
}

#[async_trait]
impl ContentResolver for StaticResolver {
    async fn resolve(&self, content_id: &str) -> Result<ContentDescriptor> {
        if content_id == "unknown" {
            return Err(Error::ContentNotFound {
                status: 404,
                url: content_id.to_string(),
            });
        }
        Ok(ContentDescriptor::new(
            content_id,
            "qobuz",
            format!("{}/{content_id}", self.base),
            format!("track-{content_id}"),
            "flac",
        ))
    }
}

#[tokio::test]
async fn enqueue_content_resolves_through_the_provider() {
    let server = MockServer::start().await;
    serve(&server, "42", b"hello").await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir)).with_resolver(Arc::new(StaticResolver {
        base: server.uri(),
    }));
    let handle = engine.start();

    let id = engine.enqueue_content("42", Priority::High).await.unwrap();
    wait_idle(&engine).await;

    let task = engine.queue().get(id).await.unwrap();
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.state, TaskState::Completed);
    assert!(dir.path().join("track-42.flac").is_file());

    assert!(matches!(
        engine.enqueue_content("unknown", Priority::Normal).await,
        Err(Error::ContentNotFound { .. })
    ));

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn enqueue_content_without_resolver_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));

    let err = engine
        .enqueue_content("42", Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config { key: Some(ref k), .. } if k == "resolver"));
}

// --- cancellation & shutdown ---

#[tokio::test]
async fn cancel_interrupts_an_in_flight_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"hello".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(descriptor(&server, "slow")))
        .await
        .unwrap();
    wait_for_state(&engine, id, TaskState::Downloading).await;

    engine.cancel(id).await.unwrap();
    assert_eq!(
        engine.queue().get(id).await.unwrap().state,
        TaskState::Cancelled
    );
    wait_idle(&engine).await;

    assert_eq!(engine.active_count().await, 0);
    assert!(!dir.path().join("slow.flac").exists());
    assert!(!dir.path().join("slow.flac.part").exists());

    engine.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test]
async fn cancel_right_after_dequeue_reaches_the_runner() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));

    let id = engine
        .enqueue(Task::new(descriptor(&server, "a")))
        .await
        .unwrap();
    let task = engine.queue().dequeue_next().await.unwrap();
    let cancel = engine.track(id).await;

    engine.cancel(id).await.unwrap();
    assert!(cancel.is_cancelled());

    engine.run_task(task, cancel).await;
    assert_eq!(
        engine.queue().get(id).await.unwrap().state,
        TaskState::Cancelled
    );
    assert_eq!(engine.active_count().await, 0);
    assert!(!dir.path().join("a.flac").exists());
}

#[tokio::test]
async fn runner_skips_a_task_cancelled_before_it_was_tracked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));

    let id = engine
        .enqueue(Task::new(descriptor(&server, "a")))
        .await
        .unwrap();
    let task = engine.queue().dequeue_next().await.unwrap();
    engine.cancel(id).await.unwrap();

    let cancel = engine.track(id).await;
    assert!(!cancel.is_cancelled());
    engine.run_task(task, cancel).await;

    assert_eq!(engine.active_count().await, 0);
    assert!(!dir.path().join("a.flac").exists());
    assert!(!dir.path().join("a.flac.part").exists());
}

#[tokio::test]
async fn shutdown_stops_the_processor_and_in_flight_work() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"hello".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let engine = engine_with(test_config(&dir));
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(descriptor(&server, "slow")))
        .await
        .unwrap();
    wait_for_state(&engine, id, TaskState::Downloading).await;

    tokio::time::timeout(Duration::from_secs(10), engine.shutdown())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(engine.active_count().await, 0);
    assert_eq!(
        engine.queue().get(id).await.unwrap().state,
        TaskState::Cancelled
    );
}

// --- progress ---

#[tokio::test]
async fn engine_observer_receives_task_progress() {
    let server = MockServer::start().await;
    serve(&server, "a", b"hello").await;
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = move |id: TaskId, downloaded: u64, _total: Option<u64>| {
        sink.lock().unwrap().push((id, downloaded));
    };
    let engine = engine_with(test_config(&dir)).with_observer(Arc::new(observer));
    let handle = engine.start();

    let id = engine
        .enqueue(Task::new(descriptor(&server, "a")))
        .await
        .unwrap();
    wait_idle(&engine).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.last(), Some(&(id, 5)));
    assert!(seen.iter().all(|(task, _)| *task == id));

    engine.shutdown().await;
    handle.await.unwrap();
}
