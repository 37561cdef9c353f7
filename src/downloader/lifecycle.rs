//! Graceful shutdown.

use crate::error::Result;
use crate::types::Event;
use std::time::Duration;

use super::{DownloadManager, StopReason};

/// How often shutdown re-checks for running workers
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl DownloadManager {
    /// Gracefully shut down the manager
    ///
    /// 1. Stops accepting new tasks (`enqueue` returns `ShuttingDown`)
    /// 2. Stops the scheduler so nothing else is admitted
    /// 3. Signals every active transfer to flush and requeue
    /// 4. Waits up to `shutdown_timeout` for the workers to exit
    /// 5. Emits [`Event::Shutdown`] and closes the persistence adapter
    ///
    /// Workers that miss the timeout leave their task `Active` on disk; the
    /// next start requeues it from the last persisted offset.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");

        self.queue_state
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.queue_state.scheduler_token.cancel();
        tracing::info!("stopped accepting new tasks");

        self.requeue_all_active().await;

        let shutdown_timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, self.wait_for_active_downloads()).await {
            Ok(()) => tracing::info!("all active transfers stopped"),
            Err(_) => tracing::warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "timeout waiting for transfers to stop, proceeding with shutdown"
            ),
        }

        self.emit_event(Event::Shutdown);

        if let Err(e) = self.store.persistence().close().await {
            tracing::error!(error = %e, "failed to close persistence");
            return Err(e);
        }

        tracing::info!("graceful shutdown complete");
        Ok(())
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        !self
            .queue_state
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Signal every active transfer to stop and return to the queue
    pub(crate) async fn requeue_all_active(&self) {
        let active = self.queue_state.active_downloads.lock().await;
        tracing::debug!(active_count = active.len(), "signalling active transfers");

        for (id, handle) in active.iter() {
            tracing::debug!(task_id = id.0, "signalling requeue");
            handle.signal(StopReason::Requeue);
        }
    }

    async fn wait_for_active_downloads(&self) {
        loop {
            let active_count = self.queue_state.active_downloads.lock().await.len();
            if active_count == 0 {
                return;
            }

            tracing::debug!(active_count, "waiting for active transfers to stop");
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }
}
