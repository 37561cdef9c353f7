//! Durable storage interface for task records
//!
//! The task store writes every mutation through a [`PersistenceAdapter`]
//! before committing it in memory. Two implementations ship with the crate:
//! [`crate::db::Database`] (SQLite) and [`MemoryPersistence`].

use crate::error::{Error, Result};
use crate::types::{TaskId, TaskRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Load/save interface for task records
///
/// Each call is atomic per record: after `save` returns `Ok`, a later
/// `load_all` returns exactly that record; after it returns `Err`, the
/// previously saved version is still intact.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Load every stored record
    async fn load_all(&self) -> Result<Vec<TaskRecord>>;

    /// Reserve a task id that has never been handed out before
    async fn allocate_id(&self) -> Result<TaskId>;

    /// Insert or replace a record
    async fn save(&self, record: &TaskRecord) -> Result<()>;

    /// Delete a record (deleting a missing id is not an error)
    async fn delete(&self, id: TaskId) -> Result<()>;

    /// Release underlying resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory persistence, for tests and for managers that do not need to
/// survive a restart
///
/// Writes can be made to fail on demand with [`MemoryPersistence::fail_writes`].
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    last_id: AtomicI64,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records, as if from a previous run
    pub fn with_records(records: Vec<TaskRecord>) -> Self {
        let last_id = records.iter().map(|r| r.id.0).max().unwrap_or(0);
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
            last_id: AtomicI64::new(last_id),
            ..Default::default()
        }
    }

    /// Make every subsequent `save` and `delete` fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Currently stored version of a record
    pub async fn stored(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory persistence is failing writes".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn allocate_id(&self) -> Result<TaskId> {
        Ok(TaskId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.check_writable()?;
        self.records.lock().await.insert(record.id, record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<()> {
        self.check_writable()?;
        self.records.lock().await.remove(&id);
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;
    use chrono::Utc;
    use std::path::PathBuf;

    fn record(id: i64) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: TaskId(id),
            source_url: format!("https://example.com/{id}"),
            destination_path: PathBuf::from(format!("/tmp/{id}")),
            status: Status::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            resume_offset: 0,
            validator: None,
            attempt_count: 0,
            last_error: None,
            last_error_kind: None,
            priority: 0,
            sequence: id,
            eligible_at: None,
            expected_sha256: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ids_continue_after_preloaded_records() {
        let persistence = MemoryPersistence::with_records(vec![record(4), record(9)]);
        assert_eq!(persistence.allocate_id().await.unwrap(), TaskId(10));
        assert_eq!(persistence.allocate_id().await.unwrap(), TaskId(11));
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_version() {
        let persistence = MemoryPersistence::new();
        persistence.save(&record(1)).await.unwrap();

        persistence.fail_writes(true);
        let mut changed = record(1);
        changed.status = Status::Paused;
        assert!(persistence.save(&changed).await.is_err());
        assert!(persistence.delete(TaskId(1)).await.is_err());

        let stored = persistence.stored(TaskId(1)).await.unwrap();
        assert_eq!(stored.status, Status::Queued);
        assert_eq!(persistence.save_count(), 1);
    }

    #[tokio::test]
    async fn load_all_is_sorted_by_id() {
        let persistence = MemoryPersistence::with_records(vec![record(3), record(1), record(2)]);
        let ids: Vec<i64> = persistence
            .load_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
