//! Free-space preflight and admission halting.

use crate::error::{Error, Result};
use crate::types::Event;
use std::sync::atomic::Ordering;

use super::DownloadManager;

impl DownloadManager {
    /// Check that the temp volume has at least `disk_space.min_free_space` free
    ///
    /// Run before every admission. Always succeeds when the check is disabled.
    pub(crate) async fn check_disk_space(&self) -> Result<()> {
        let disk_space = &self.config.disk_space;
        if !disk_space.enabled {
            return Ok(());
        }

        let check_path = self.config.temp_dir().clone();
        let available = tokio::task::spawn_blocking(move || {
            crate::utils::get_available_space(&check_path)
        })
        .await
        .map_err(|e| Error::DiskSpaceCheckFailed(format!("space probe panicked: {e}")))?
        .map_err(|e| {
            Error::DiskSpaceCheckFailed(format!(
                "Failed to check disk space for '{}': {}",
                self.config.temp_dir().display(),
                e
            ))
        })?;

        if available < disk_space.min_free_space {
            return Err(Error::InsufficientSpace {
                required: disk_space.min_free_space,
                available,
            });
        }

        Ok(())
    }

    /// Stop admitting queued tasks; active transfers continue
    pub(crate) fn halt_admissions(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.queue_state.admission_halted.swap(true, Ordering::SeqCst) {
            tracing::warn!(reason = %reason, "admissions halted");
            self.emit_event(Event::AdmissionHalted { reason });
        }
    }

    /// Allow admissions again after a storage problem was fixed
    pub fn resume_admissions(&self) {
        if self.queue_state.admission_halted.swap(false, Ordering::SeqCst) {
            tracing::info!("admissions resumed");
            self.emit_event(Event::AdmissionResumed);
        }
        self.wake_scheduler();
    }

    /// Whether admissions are currently halted
    pub fn is_admission_halted(&self) -> bool {
        self.queue_state.admission_halted.load(Ordering::SeqCst)
    }
}
