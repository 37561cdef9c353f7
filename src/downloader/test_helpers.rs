//! Shared test helpers: a scripted in-memory transport and manager builders.

use crate::config::Config;
use crate::db::Database;
use crate::downloader::DownloadManager;
use crate::error::TransferError;
use crate::persistence::PersistenceAdapter;
use crate::transport::{FetchRequest, FetchResponse, ResponseMeta, Transport};
use crate::types::{Status, TaskId, TaskRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::Semaphore;

/// One scripted answer of [`MockTransport`]
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    /// Serve the current resource, honoring `Range` and `If-Range`
    Serve,
    /// Fail before any headers
    Fail(TransferError),
    /// Serve, but break the body off with `error` after `after` bytes
    BreakAfter { after: usize, error: TransferError },
}

struct Resource {
    data: Vec<u8>,
    validator: Option<String>,
    ranges: bool,
}

/// Range-capable in-memory server
///
/// Replies are taken from the script in order; once it is empty every
/// request is served normally. With [`hold_bodies`](Self::hold_bodies) each
/// body stays open after its last byte until [`release`](Self::release)
/// lets it finish, which keeps transfers `Active` for as long as a test needs.
pub(crate) struct MockTransport {
    resource: Mutex<Resource>,
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<FetchRequest>>,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub(crate) fn new(data: impl Into<Vec<u8>>, validator: Option<&str>) -> Self {
        Self {
            resource: Mutex::new(Resource {
                data: data.into(),
                validator: validator.map(str::to_string),
                ranges: true,
            }),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 4,
            gate: None,
        }
    }

    /// Keep every body open after its data until released
    pub(crate) fn hold_bodies(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Answer range requests with the full body
    pub(crate) fn without_ranges(self) -> Self {
        self.resource.lock().unwrap().ranges = false;
        self
    }

    pub(crate) fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Let `n` held bodies finish
    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub(crate) fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().unwrap().extend(replies);
    }

    /// Replace the resource (a new version on the server)
    pub(crate) fn set_resource(&self, data: impl Into<Vec<u8>>, validator: Option<&str>) {
        let mut resource = self.resource.lock().unwrap();
        resource.data = data.into();
        resource.validator = validator.map(str::to_string);
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn respond(
        &self,
        request: &FetchRequest,
        break_after: Option<(usize, TransferError)>,
    ) -> Result<FetchResponse, TransferError> {
        let resource = self.resource.lock().unwrap();
        let total = resource.data.len() as u64;

        let validator_matches = match &request.validator {
            Some(sent) => resource.validator.as_ref() == Some(sent),
            None => true,
        };

        let (meta, start) = if request.offset > 0 && resource.ranges && validator_matches {
            if request.offset >= total {
                return Err(TransferError::RangeNotSatisfiable {
                    offset: request.offset,
                });
            }
            (
                ResponseMeta {
                    status: 206,
                    total_bytes: Some(total),
                    validator: resource.validator.clone(),
                    supports_range: true,
                    start_offset: request.offset,
                },
                request.offset as usize,
            )
        } else {
            (
                ResponseMeta {
                    status: 200,
                    total_bytes: Some(total),
                    validator: resource.validator.clone(),
                    supports_range: resource.ranges,
                    start_offset: 0,
                },
                0,
            )
        };

        let mut payload = &resource.data[start..];
        let mut tail_error = None;
        if let Some((after, error)) = break_after {
            payload = &payload[..after.min(payload.len())];
            tail_error = Some(error);
        }

        let mut chunks: Vec<Result<Bytes, TransferError>> = payload
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some(error) = tail_error {
            chunks.push(Err(error));
        }

        let body = futures::stream::iter(chunks);
        let body = match self.gate.clone() {
            Some(gate) => body
                .chain(
                    futures::stream::once(async move {
                        if let Ok(permit) = gate.acquire_owned().await {
                            permit.forget();
                        }
                    })
                    .filter_map(|_| {
                        futures::future::ready(None::<Result<Bytes, TransferError>>)
                    }),
                )
                .boxed(),
            None => body.boxed(),
        };

        Ok(FetchResponse { meta, body })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransferError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Serve);
        match reply {
            Reply::Serve => self.respond(request, None),
            Reply::Fail(error) => Err(error),
            Reply::BreakAfter { after, error } => self.respond(request, Some((after, error))),
        }
    }
}

/// Config rooted in `dir` with fast retries, tiny flush thresholds and no disk check
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("test.db");
    config.download.temp_dir = dir.join("temp");
    config.download.max_concurrent_downloads = 3;
    config.download.flush_bytes = 4;
    config.download.flush_interval = Duration::from_millis(20);
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config.disk_space.enabled = false;
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Helper to create a test DownloadManager with a persistent SQLite store.
/// Returns the manager and the tempdir (which must be kept alive).
pub(crate) async fn create_test_manager(
    transport: Arc<MockTransport>,
) -> (DownloadManager, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(temp_dir.path());
    let manager = create_manager_with(config, transport).await;
    (manager, temp_dir)
}

/// Build a manager from `config` over its SQLite database
pub(crate) async fn create_manager_with(
    config: Config,
    transport: Arc<MockTransport>,
) -> DownloadManager {
    let db = Database::new(&config.persistence.database_path)
        .await
        .unwrap();
    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(db);
    DownloadManager::with_components(config, persistence, transport, Vec::new())
        .await
        .unwrap()
}

/// Poll until `condition` holds for the task, panicking after 5 seconds
pub(crate) async fn wait_for(
    manager: &DownloadManager,
    id: TaskId,
    condition: impl Fn(&TaskRecord) -> bool,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = manager.status(id).await.unwrap();
        if condition(&record) {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on task {id}; last state: {record:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) async fn wait_for_status(
    manager: &DownloadManager,
    id: TaskId,
    status: Status,
) -> TaskRecord {
    wait_for(manager, id, |r| r.status == status).await
}

/// Poll until the manager has exactly `count` active transfers
pub(crate) async fn wait_for_active(manager: &DownloadManager, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.active_count().await != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} active transfers, have {}",
            manager.active_count().await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Sample resource payload
pub(crate) const PAYLOAD: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
