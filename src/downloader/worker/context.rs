//! Worker context: shared state for one transfer and progress checkpoints.

use crate::error::TransferError;
use crate::store::ProgressUpdate;
use crate::types::{TaskId, TaskRecord};
use std::path::PathBuf;

use super::super::{DownloadManager, StopHandle};

/// How a transfer attempt ended, before the exit transition is chosen
#[derive(Debug)]
pub(super) enum WorkerOutcome {
    /// The file was verified and moved to its destination
    Completed,
    /// A stop signal was observed; the reason is read at exit
    Stopped,
    /// The attempt failed
    Failed(TransferError),
}

/// Where a transfer picks up
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct ResumePoint {
    pub(super) offset: u64,
    pub(super) validator: Option<String>,
    pub(super) total_bytes: Option<u64>,
}

impl ResumePoint {
    pub(super) fn from_record(record: &TaskRecord) -> Self {
        Self {
            offset: record.resume_offset,
            validator: record.validator.clone(),
            total_bytes: record.total_bytes,
        }
    }

    /// Back to byte 0 against a resource whose version is not yet known
    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared context for a single transfer, reducing parameter passing between helpers.
pub(crate) struct WorkerContext {
    pub(crate) id: TaskId,
    pub(crate) manager: DownloadManager,
    pub(crate) stop: StopHandle,
    pub(super) temp_path: PathBuf,
    /// Restarts from byte 0 during this admission
    pub(super) restarts: u32,
}

impl WorkerContext {
    pub(crate) fn new(manager: DownloadManager, id: TaskId, stop: StopHandle) -> Self {
        let temp_path = manager.temp_path(id);
        Self {
            id,
            manager,
            stop,
            temp_path,
            restarts: 0,
        }
    }

    /// Persist flushed progress through the store
    ///
    /// A failure here stops the attempt as a transient error: bytes on disk
    /// beyond the last persisted offset are re-fetched on the next attempt.
    pub(super) async fn checkpoint(&self, update: ProgressUpdate) -> Result<(), TransferError> {
        let bytes = update.bytes_downloaded;
        self.manager
            .store
            .record_progress(self.id, update)
            .await
            .map(|_| {
                tracing::debug!(task_id = self.id.0, bytes, "progress checkpoint");
            })
            .map_err(|e| {
                tracing::error!(task_id = self.id.0, error = %e, "failed to persist progress");
                TransferError::Io(format!("failed to persist progress: {e}"))
            })
    }
}
