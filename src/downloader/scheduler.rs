//! Admission scheduler -- grants worker slots to queued tasks.

use crate::error::Error;
use crate::store::Transition;
use crate::types::TaskRecord;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

use super::worker::{WorkerContext, run_transfer};
use super::{DownloadManager, StopHandle};

/// Longest idle sleep; bounds how late a backoff expiry is noticed
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Result of one admission attempt
enum Admission {
    /// A worker was spawned and owns the permit
    Started,
    /// Nothing admissible right now; the permit comes back
    Idle(OwnedSemaphorePermit),
}

impl DownloadManager {
    /// Start the scheduler task
    ///
    /// This method spawns a background task that continuously:
    /// 1. Acquires a permit from the concurrency limiter (respects max_concurrent_downloads)
    /// 2. Picks the best eligible queued task (priority desc, then enqueue order)
    /// 3. Admits it and spawns a worker that carries the permit
    /// 4. When nothing is eligible, returns the permit and sleeps until woken
    ///    or until the earliest retry backoff expires
    ///
    /// Runs until [`shutdown`](Self::shutdown).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let token = self.queue_state.scheduler_token.clone();

        tokio::spawn(async move {
            tracing::info!(
                max_concurrent = manager.config.download.max_concurrent_downloads,
                "scheduler started"
            );

            loop {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    permit = manager.queue_state.concurrent_limit.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    // Semaphore closed
                    break;
                };

                match manager.admit_next(permit).await {
                    Admission::Started => {}
                    Admission::Idle(permit) => {
                        drop(permit);
                        let wait = manager.idle_wait().await;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = manager.queue_state.wake.notified() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }

            tracing::info!("scheduler stopped");
        })
    }

    /// Admit the best eligible task, if any, using `permit` as its slot
    ///
    /// Selection, the `Admit` transition and registration of the stop handle
    /// all happen under the active-transfer lock.
    async fn admit_next(&self, permit: OwnedSemaphorePermit) -> Admission {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst)
            || self.queue_state.admission_halted.load(Ordering::SeqCst)
        {
            return Admission::Idle(permit);
        }

        let mut active = self.queue_state.active_downloads.lock().await;

        let Some(candidate) = self.store.next_eligible(Utc::now()).await else {
            return Admission::Idle(permit);
        };

        match self.check_disk_space().await {
            Ok(()) => {}
            Err(e @ Error::InsufficientSpace { .. }) => {
                drop(active);
                self.halt_admissions(e.to_string());
                return Admission::Idle(permit);
            }
            // A probe failure is not evidence of a full disk
            Err(e) => tracing::warn!(error = %e, "disk space check failed, admitting anyway"),
        }

        let record = match self.store.update_status(candidate.id, Transition::Admit).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(task_id = candidate.id.0, error = %e, "failed to admit task");
                drop(active);
                // Avoids spinning on a store that keeps rejecting writes
                tokio::time::sleep(MAX_IDLE_WAIT).await;
                return Admission::Idle(permit);
            }
        };

        let stop = StopHandle::new();
        active.insert(record.id, stop.clone());
        drop(active);

        log_admission(&record);
        let ctx = WorkerContext::new(self.clone(), record.id, stop);
        tokio::spawn(run_transfer(ctx, permit));
        Admission::Started
    }

    /// How long to sleep when nothing is admissible
    async fn idle_wait(&self) -> Duration {
        let now = Utc::now();
        match self.store.earliest_pending_retry(now).await {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_IDLE_WAIT),
            None => MAX_IDLE_WAIT,
        }
    }
}

fn log_admission(record: &TaskRecord) {
    tracing::info!(
        task_id = record.id.0,
        priority = record.priority,
        offset = record.resume_offset,
        attempt = record.attempt_count + 1,
        "task admitted"
    );
}
