//! Task store: the single source of truth for task state
//!
//! The store keeps every [`TaskRecord`] in memory behind a `tokio::sync::RwLock`.
//! A mutation takes the write lock, builds the new record, persists it through
//! the [`PersistenceAdapter`] and only then commits it to the map and publishes
//! an event, all before releasing the lock. Readers therefore never observe an
//! unpersisted state, and events for one task arrive in transition order.

mod transition;


pub use transition::{ProgressUpdate, Transition};

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::persistence::PersistenceAdapter;
use crate::types::{Event, Status, TaskChange, TaskFilter, TaskId, TaskOptions, TaskRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fields of a task supplied at creation
#[derive(Clone, Debug)]
pub struct NewTask {
    /// Source URL
    pub source_url: String,
    /// Final path of the downloaded file
    pub destination_path: PathBuf,
    /// Priority (higher first)
    pub priority: i32,
    /// Expected lowercase hex SHA-256 digest
    pub expected_sha256: Option<String>,
}

impl From<TaskOptions> for NewTask {
    fn from(options: TaskOptions) -> Self {
        Self {
            source_url: options.url,
            destination_path: options.destination,
            priority: options.priority,
            expected_sha256: options.expected_sha256,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, TaskRecord>,
    last_sequence: i64,
}

impl StoreInner {
    fn next_sequence(&mut self) -> i64 {
        self.last_sequence += 1;
        self.last_sequence
    }
}

/// In-memory registry of task records backed by a persistence adapter
pub struct TaskStore {
    inner: RwLock<StoreInner>,
    persistence: Arc<dyn PersistenceAdapter>,
    events: EventBus,
}

impl TaskStore {
    /// Create an empty store; call [`load`](Self::load) to restore persisted tasks
    pub fn new(persistence: Arc<dyn PersistenceAdapter>, events: EventBus) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            persistence,
            events,
        }
    }

    /// The persistence adapter behind this store
    pub fn persistence(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.persistence
    }

    /// Restore all persisted tasks
    ///
    /// Tasks that were `Active` when the previous process stopped are rewritten
    /// as `Queued` (and the rewrite persisted) so the scheduler picks them up
    /// again. Returns the number of restored tasks.
    pub async fn load(&self) -> Result<usize> {
        let records = self.persistence.load_all().await?;
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut requeued = 0usize;

        for mut record in records {
            if record.status == Status::Active {
                Transition::Requeue.apply(&mut record, now);
                self.persistence.save(&record).await?;
                requeued += 1;
            }
            inner.last_sequence = inner.last_sequence.max(record.sequence);
            inner.tasks.insert(record.id, record);
        }

        let total = inner.tasks.len();
        tracing::info!(
            restored = total,
            requeued,
            "restored tasks from persistence"
        );
        Ok(total)
    }

    /// Create a new `Queued` task
    pub async fn create(&self, new: NewTask) -> Result<TaskRecord> {
        let mut inner = self.inner.write().await;
        let id = self.persistence.allocate_id().await?;
        let now = Utc::now();

        let record = TaskRecord {
            id,
            source_url: new.source_url,
            destination_path: new.destination_path,
            status: Status::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            resume_offset: 0,
            validator: None,
            attempt_count: 0,
            last_error: None,
            last_error_kind: None,
            priority: new.priority,
            sequence: inner.last_sequence + 1,
            eligible_at: None,
            expected_sha256: new.expected_sha256,
            created_at: now,
            updated_at: now,
        };

        self.persistence.save(&record).await?;
        inner.next_sequence();
        inner.tasks.insert(id, record.clone());
        self.publish(None, &record);

        tracing::debug!(task_id = id.0, priority = record.priority, "task created");
        Ok(record)
    }

    /// Get a task by id
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// Current status of a task
    pub async fn status(&self, id: TaskId) -> Result<Status> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .map(|r| r.status)
            .ok_or(Error::NotFound(id))
    }

    /// Tasks matching `filter`, ordered by priority (highest first) then enqueue order
    pub async fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        records
    }

    /// Number of tasks in `status`
    pub async fn count(&self, status: Status) -> usize {
        self.inner
            .read()
            .await
            .tasks
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Best task the scheduler may admit at `now`
    pub async fn next_eligible(&self, now: DateTime<Utc>) -> Option<TaskRecord> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .values()
            .filter(|r| r.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            })
            .cloned()
    }

    /// Earliest retry time among queued tasks still waiting out a backoff
    pub async fn earliest_pending_retry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .values()
            .filter(|r| r.status == Status::Queued)
            .filter_map(|r| r.eligible_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Apply a state-machine transition
    ///
    /// Returns [`Error::InvalidTransition`] when the task's current state does
    /// not allow it. On a persistence failure the in-memory record is unchanged.
    pub async fn update_status(&self, id: TaskId, transition: Transition) -> Result<TaskRecord> {
        let mut inner = self.inner.write().await;
        let current = inner.tasks.get(&id).ok_or(Error::NotFound(id))?;

        let old_status = current.status;
        if !transition.allowed_from(old_status) {
            return Err(Error::InvalidTransition {
                id,
                from: old_status,
                transition: transition.name(),
            });
        }

        let mut updated = current.clone();
        transition.apply(&mut updated, Utc::now());
        if transition == Transition::Restart {
            updated.sequence = inner.last_sequence + 1;
        }

        self.persistence.save(&updated).await?;
        if transition == Transition::Restart {
            inner.next_sequence();
        }
        inner.tasks.insert(id, updated.clone());
        self.publish(Some(old_status), &updated);

        tracing::debug!(
            task_id = id.0,
            from = %old_status,
            to = %updated.status,
            transition = transition.name(),
            "task transitioned"
        );
        Ok(updated)
    }

    /// Record flushed progress of an `Active` task
    ///
    /// Rejects updates that would put `bytes_downloaded` above `total_bytes`.
    pub async fn record_progress(&self, id: TaskId, update: ProgressUpdate) -> Result<TaskRecord> {
        let mut inner = self.inner.write().await;
        let current = inner.tasks.get(&id).ok_or(Error::NotFound(id))?;

        if current.status != Status::Active {
            return Err(Error::InvalidTransition {
                id,
                from: current.status,
                transition: "record_progress",
            });
        }
        if let Some(violation) = update.violation(current) {
            return Err(Error::InvalidRequest(format!("task {id}: {violation}")));
        }

        let mut updated = current.clone();
        update.apply(&mut updated, Utc::now());

        self.persistence.save(&updated).await?;
        inner.tasks.insert(id, updated.clone());
        self.publish(Some(Status::Active), &updated);
        Ok(updated)
    }

    /// Change the priority of a non-terminal task
    pub async fn set_priority(&self, id: TaskId, priority: i32) -> Result<TaskRecord> {
        let mut inner = self.inner.write().await;
        let current = inner.tasks.get(&id).ok_or(Error::NotFound(id))?;

        if current.status.is_terminal() {
            return Err(Error::InvalidTransition {
                id,
                from: current.status,
                transition: "set_priority",
            });
        }
        if current.priority == priority {
            return Ok(current.clone());
        }

        let mut updated = current.clone();
        updated.priority = priority;
        updated.updated_at = Utc::now();

        self.persistence.save(&updated).await?;
        inner.tasks.insert(id, updated.clone());
        self.publish(Some(updated.status), &updated);
        Ok(updated)
    }

    /// Delete a task record
    pub async fn delete(&self, id: TaskId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&id) {
            return Err(Error::NotFound(id));
        }

        self.persistence.delete(id).await?;
        inner.tasks.remove(&id);
        self.events.emit(Event::TaskRemoved { id });

        tracing::debug!(task_id = id.0, "task deleted");
        Ok(())
    }

    fn publish(&self, old_status: Option<Status>, record: &TaskRecord) {
        self.events.emit(Event::TaskChanged(TaskChange {
            id: record.id,
            old_status,
            new_status: record.status,
            progress: record.progress(),
        }));
    }
}
