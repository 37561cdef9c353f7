//! End-to-end downloads through the SQLite store and the reqwest transport

use resumable_dl::{
    Config, Database, DownloadManager, ErrorKind, Event, PersistenceAdapter, Status, TaskId,
    TaskOptions, TaskRecord,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("state.db");
    config.download.temp_dir = dir.join("partial");
    config.download.flush_interval = Duration::from_millis(20);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config.retry.jitter = false;
    config.disk_space.enabled = false;
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

async fn wait_for_status(manager: &DownloadManager, id: TaskId, status: Status) -> TaskRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = manager.status(id).await.unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status:?}"))
}

async fn full_body(server: &MockServer, etag: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", etag)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

/// Leave a half-finished task behind: a persisted offset plus the matching temp file
async fn seed_partial(
    config: &Config,
    server: &MockServer,
    destination: &Path,
    offset: usize,
    validator: &str,
) -> TaskId {
    let manager = DownloadManager::new(config.clone()).await.unwrap();
    let id = manager
        .enqueue(format!("{}/file.bin", server.uri()), destination, None)
        .await
        .unwrap();
    let temp_path = manager.temp_path(id);
    manager.shutdown().await.unwrap();

    std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
    std::fs::write(&temp_path, &BODY[..offset]).unwrap();

    let db = Database::new(&config.persistence.database_path).await.unwrap();
    let mut record = db.get_task(id).await.unwrap().unwrap();
    record.bytes_downloaded = offset as u64;
    record.resume_offset = offset as u64;
    record.total_bytes = Some(BODY.len() as u64);
    record.validator = Some(validator.to_string());
    db.upsert_task(&record).await.unwrap();
    db.close().await.unwrap();
    id
}

#[tokio::test]
async fn download_completes_and_verifies_checksum() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    full_body(&server, "\"v1\"", BODY).await;

    let manager = DownloadManager::new(config(temp_dir.path())).await.unwrap();
    manager.start();

    let destination = temp_dir.path().join("downloads/file.bin");
    let digest = format!("{:x}", Sha256::digest(BODY));
    let id = manager
        .enqueue_task(
            TaskOptions::new(format!("{}/file.bin", server.uri()), &destination).sha256(digest),
        )
        .await
        .unwrap();

    let record = wait_for_status(&manager, id, Status::Completed).await;
    assert_eq!(record.bytes_downloaded, BODY.len() as u64);
    assert_eq!(record.total_bytes, Some(BODY.len() as u64));
    assert_eq!(record.validator.as_deref(), Some("\"v1\""));
    assert_eq!(std::fs::read(&destination).unwrap(), BODY);
    assert!(!manager.temp_path(id).exists());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn checksum_mismatch_fails_without_publishing_the_file() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    full_body(&server, "\"v1\"", BODY).await;

    let manager = DownloadManager::new(config(temp_dir.path())).await.unwrap();
    manager.start();

    let destination = temp_dir.path().join("file.bin");
    let id = manager
        .enqueue_task(
            TaskOptions::new(format!("{}/file.bin", server.uri()), &destination)
                .sha256("0".repeat(64)),
        )
        .await
        .unwrap();

    let record = wait_for_status(&manager, id, Status::Failed).await;
    assert_eq!(record.last_error_kind, Some(ErrorKind::Permanent));
    assert_eq!(record.resume_offset, 0);
    assert!(!destination.exists());
    assert!(!manager.temp_path(id).exists());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn persisted_partial_resumes_with_a_range_request() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .and(header("Range", "bytes=10-"))
        .and(header("If-Range", "\"v1\""))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("ETag", "\"v1\"")
                .insert_header("Content-Range", "bytes 10-35/36")
                .set_body_bytes(&BODY[10..]),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    full_body(&server, "\"v1\"", BODY).await;

    let destination = temp_dir.path().join("file.bin");
    let id = seed_partial(&config, &server, &destination, 10, "\"v1\"").await;

    let manager = DownloadManager::new(config).await.unwrap();
    manager.start();
    wait_for_status(&manager, id, Status::Completed).await;
    assert_eq!(std::fs::read(&destination).unwrap(), BODY);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1, "only the tail is fetched");
    assert_eq!(received[0].headers["range"], "bytes=10-");

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn changed_resource_restarts_from_zero() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());
    let server = MockServer::start().await;
    let updated: Vec<u8> = BODY.iter().rev().copied().collect();
    // If-Range does not match, so the server sends the new version in full
    full_body(&server, "\"v2\"", &updated).await;

    let destination = temp_dir.path().join("file.bin");
    let id = seed_partial(&config, &server, &destination, 10, "\"v1\"").await;

    let manager = DownloadManager::new(config).await.unwrap();
    let mut events = manager.subscribe();
    manager.start();

    let record = wait_for_status(&manager, id, Status::Completed).await;
    assert_eq!(record.validator.as_deref(), Some("\"v2\""));
    assert_eq!(std::fs::read(&destination).unwrap(), updated);

    let mut restarted = false;
    while let Ok(event) = events.try_recv() {
        restarted |= matches!(event, Event::TransferRestarted { id: restarted_id } if restarted_id == id);
    }
    assert!(restarted);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    full_body(&server, "\"v1\"", BODY).await;

    let manager = DownloadManager::new(config(temp_dir.path())).await.unwrap();
    let mut events = manager.subscribe();
    manager.start();

    let destination = temp_dir.path().join("file.bin");
    let id = manager
        .enqueue(format!("{}/file.bin", server.uri()), &destination, None)
        .await
        .unwrap();
    wait_for_status(&manager, id, Status::Completed).await;
    assert_eq!(std::fs::read(&destination).unwrap(), BODY);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::RetryScheduled { attempt, .. } = event {
            retries.push(attempt);
        }
    }
    assert_eq!(retries, vec![1, 2]);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_resource_fails_permanently() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let manager = DownloadManager::new(config(temp_dir.path())).await.unwrap();
    manager.start();

    let id = manager
        .enqueue(
            format!("{}/file.bin", server.uri()),
            temp_dir.path().join("file.bin"),
            None,
        )
        .await
        .unwrap();
    let record = wait_for_status(&manager, id, Status::Failed).await;
    assert_eq!(record.last_error_kind, Some(ErrorKind::Permanent));
    assert_eq!(record.attempt_count, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn completed_tasks_survive_a_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());
    let server = MockServer::start().await;
    full_body(&server, "\"v1\"", BODY).await;

    let id = {
        let manager = DownloadManager::new(config.clone()).await.unwrap();
        manager.start();
        let id = manager
            .enqueue(
                format!("{}/file.bin", server.uri()),
                temp_dir.path().join("file.bin"),
                Some(3),
            )
            .await
            .unwrap();
        wait_for_status(&manager, id, Status::Completed).await;
        manager.shutdown().await.unwrap();
        id
    };

    let manager = DownloadManager::new(config).await.unwrap();
    let record = manager.status(id).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.priority, 3);
    assert_eq!(record.bytes_downloaded, BODY.len() as u64);

    // Nothing is re-downloaded
    manager.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn database_rows_reflect_progress() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());
    let server = MockServer::start().await;
    full_body(&server, "\"v1\"", BODY).await;

    let manager = DownloadManager::new(config.clone()).await.unwrap();
    manager.start();
    let id = manager
        .enqueue(
            format!("{}/file.bin", server.uri()),
            temp_dir.path().join("file.bin"),
            None,
        )
        .await
        .unwrap();
    wait_for_status(&manager, id, Status::Completed).await;
    manager.shutdown().await.unwrap();

    let db = Database::new(&config.persistence.database_path).await.unwrap();
    let row = db.get_task(id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Completed);
    assert_eq!(row.resume_offset, BODY.len() as u64);
    assert_eq!(row.validator.as_deref(), Some("\"v1\""));
}
