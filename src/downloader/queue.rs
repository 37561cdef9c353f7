//! Enqueueing and task queries.

use crate::error::{Error, Result};
use crate::store::NewTask;
use crate::transport::validate_url;
use crate::types::{Status, TaskFilter, TaskId, TaskOptions, TaskRecord};
use crate::utils::is_sha256_hex;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use super::DownloadManager;

impl DownloadManager {
    /// Add a download to the queue
    ///
    /// # Arguments
    ///
    /// * `url` - http(s) URL of the resource
    /// * `destination` - Final path of the downloaded file
    /// * `priority` - Optional priority (higher first, default 0)
    ///
    /// # Returns
    ///
    /// The id of the new `Queued` task, or:
    /// - `ShuttingDown` once shutdown has begun
    /// - `InvalidRequest` for a malformed URL or empty destination
    /// - `StorageError` if the task could not be persisted
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use resumable_dl::*;
    /// # async fn example(manager: DownloadManager) -> Result<()> {
    /// let id = manager
    ///     .enqueue("https://example.com/disk.iso", "/downloads/disk.iso", Some(5))
    ///     .await?;
    /// println!("queued task {id}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        priority: Option<i32>,
    ) -> Result<TaskId> {
        let options = TaskOptions::new(url, destination).priority(priority.unwrap_or_default());
        self.enqueue_task(options).await
    }

    /// Add a download with full options (priority, expected checksum)
    pub async fn enqueue_task(&self, mut options: TaskOptions) -> Result<TaskId> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        validate_url(&options.url).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        if options.destination.as_os_str().is_empty() {
            return Err(Error::InvalidRequest("destination path is empty".into()));
        }
        if let Some(digest) = &options.expected_sha256
            && !is_sha256_hex(digest)
        {
            return Err(Error::InvalidRequest(format!(
                "expected_sha256 is not a 64-character hex digest: {digest}"
            )));
        }
        // Digests are stored and compared in lowercase
        if let Some(digest) = &mut options.expected_sha256 {
            digest.make_ascii_lowercase();
        }

        let record = self.store.create(NewTask::from(options)).await?;

        tracing::info!(
            task_id = record.id.0,
            url = %record.source_url,
            destination = %record.destination_path.display(),
            priority = record.priority,
            "task enqueued"
        );

        self.wake_scheduler();
        Ok(record.id)
    }

    /// Current state of a task
    pub async fn status(&self, id: TaskId) -> Result<TaskRecord> {
        self.store.get(id).await
    }

    /// Tasks matching `filter` in queue order (priority desc, then enqueue order)
    pub async fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        self.store.list(filter).await
    }

    /// Number of tasks currently owning a worker slot
    pub async fn active_count(&self) -> usize {
        self.queue_state.active_downloads.lock().await.len()
    }

    /// Number of tasks waiting for a slot
    pub async fn queued_count(&self) -> usize {
        self.store.count(Status::Queued).await
    }
}
