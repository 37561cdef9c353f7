//! Task lifecycle control: pause, resume, cancel, remove, retry, priority.
//!
//! Every operation takes the active-transfer lock first. A task with an entry
//! in that map is owned by a worker and is only ever signalled; the worker
//! applies the resulting transition on exit. Any other task is transitioned
//! directly through the store.

use crate::error::{Error, Result};
use crate::store::Transition;
use crate::types::{Event, Status, TaskFilter, TaskId};

use super::{DownloadManager, StopReason};

impl DownloadManager {
    /// Pause a task
    ///
    /// A queued task becomes `Paused` immediately. An active transfer is
    /// stopped at its next flush boundary and keeps its temp file, offset and
    /// validator so [`resume`](Self::resume) continues where it left off.
    ///
    /// # Returns
    ///
    /// Returns Ok(()) if the task is (or will shortly be) paused, including
    /// when it was already paused, or an error if:
    /// - The task doesn't exist (`NotFound`)
    /// - The task is completed, failed or cancelled (`InvalidTransition`)
    /// - Persisting the change fails (`StorageError`)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use resumable_dl::*;
    /// # async fn example(manager: DownloadManager, id: TaskId) -> Result<()> {
    /// manager.pause(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        let active = self.queue_state.active_downloads.lock().await;
        if let Some(handle) = active.get(&id) {
            handle.signal(StopReason::Pause);
            tracing::info!(task_id = id.0, "pause requested for active transfer");
            return Ok(());
        }

        match self.store.status(id).await? {
            // Already paused, nothing to do
            Status::Paused => Ok(()),
            _ => {
                self.store.update_status(id, Transition::Pause).await?;
                tracing::info!(task_id = id.0, "task paused");
                Ok(())
            }
        }
    }

    /// Resume a paused task
    ///
    /// The task returns to `Queued` with its original queue position. Resuming
    /// a queued or active task is a no-op; resuming an active task whose pause
    /// has not yet taken effect withdraws the pause.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        let active = self.queue_state.active_downloads.lock().await;
        if let Some(handle) = active.get(&id) {
            if handle.withdraw_pause() {
                tracing::debug!(task_id = id.0, "pending pause withdrawn");
            }
            return Ok(());
        }

        match self.store.status(id).await? {
            Status::Queued => Ok(()),
            _ => {
                self.store.update_status(id, Transition::Resume).await?;
                drop(active);
                tracing::info!(task_id = id.0, "task resumed");
                self.wake_scheduler();
                Ok(())
            }
        }
    }

    /// Cancel a task
    ///
    /// The temp file and persisted offset are discarded. The record stays in
    /// the store as `Cancelled`; use [`remove`](Self::remove) to delete it.
    /// Cancelling an already cancelled task returns Ok.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let active = self.queue_state.active_downloads.lock().await;
        if let Some(handle) = active.get(&id) {
            handle.signal(StopReason::Cancel);
            tracing::info!(task_id = id.0, "cancel requested for active transfer");
            return Ok(());
        }

        match self.store.status(id).await? {
            Status::Cancelled => Ok(()),
            _ => {
                self.store.update_status(id, Transition::Cancel).await?;
                drop(active);
                self.remove_temp_file(id).await;
                tracing::info!(task_id = id.0, "task cancelled");
                Ok(())
            }
        }
    }

    /// Delete a task in any state
    ///
    /// An active transfer is cancelled first; its record disappears once the
    /// worker has stopped. A transfer that finished its rename before seeing
    /// the signal keeps the file, but its record is still deleted.
    pub async fn remove(&self, id: TaskId) -> Result<()> {
        let active = self.queue_state.active_downloads.lock().await;
        if let Some(handle) = active.get(&id) {
            handle.signal(StopReason::Remove);
            tracing::info!(task_id = id.0, "remove requested for active transfer");
            return Ok(());
        }

        self.store.delete(id).await?;
        drop(active);
        self.remove_temp_file(id).await;
        tracing::info!(task_id = id.0, "task removed");
        Ok(())
    }

    /// Re-enqueue a failed task
    ///
    /// Attempts and the last error are cleared and the task goes to the back
    /// of its priority band. Offset and validator are kept, so the transfer
    /// resumes if the resource is unchanged.
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        let active = self.queue_state.active_downloads.lock().await;
        if active.contains_key(&id) {
            return Err(Error::InvalidTransition {
                id,
                from: Status::Active,
                transition: Transition::Restart.name(),
            });
        }

        self.store.update_status(id, Transition::Restart).await?;
        drop(active);
        tracing::info!(task_id = id.0, "failed task re-enqueued");
        self.wake_scheduler();
        Ok(())
    }

    /// Change the priority of a task that has not finished
    ///
    /// Takes effect at the next admission; an active transfer keeps its slot.
    pub async fn set_priority(&self, id: TaskId, priority: i32) -> Result<()> {
        self.store.set_priority(id, priority).await?;
        self.wake_scheduler();
        Ok(())
    }

    /// Pause every queued and active task
    pub async fn pause_all(&self) -> Result<()> {
        let filter = TaskFilter {
            statuses: vec![Status::Queued, Status::Active],
            ..TaskFilter::all()
        };

        let mut paused = 0usize;
        for task in self.store.list(&filter).await {
            match self.pause(task.id).await {
                Ok(()) => paused += 1,
                // The task finished or was removed between list and pause
                Err(Error::NotFound(_) | Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(paused, "queue paused");
        self.emit_event(Event::QueuePaused);
        Ok(())
    }

    /// Resume every paused task
    pub async fn resume_all(&self) -> Result<()> {
        let mut resumed = 0usize;
        for task in self.store.list(&TaskFilter::status(Status::Paused)).await {
            match self.resume(task.id).await {
                Ok(()) => resumed += 1,
                Err(Error::NotFound(_) | Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(resumed, "queue resumed");
        self.emit_event(Event::QueueResumed);
        Ok(())
    }
}
