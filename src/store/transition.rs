//! Task state machine

use crate::types::{ErrorKind, Status, TaskRecord};
use chrono::{DateTime, Utc};

/// A requested status change
///
/// | Transition   | From                           | To        |
/// |--------------|--------------------------------|-----------|
/// | `Admit`      | Queued                         | Active    |
/// | `Pause`      | Queued, Active                 | Paused    |
/// | `Resume`     | Paused                         | Queued    |
/// | `Cancel`     | Queued, Active, Paused, Failed | Cancelled |
/// | `Complete`   | Active                         | Completed |
/// | `Fail`       | Active                         | Failed    |
/// | `RetryLater` | Active                         | Queued    |
/// | `Requeue`    | Active                         | Queued    |
/// | `Restart`    | Failed                         | Queued    |
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// A worker slot was granted
    Admit,
    /// Caller paused the task
    Pause,
    /// Caller resumed a paused task; it keeps its queue position
    Resume,
    /// Caller cancelled the task; offsets and validator are discarded
    Cancel,
    /// The file was verified and renamed into place
    Complete,
    /// The transfer gave up
    Fail {
        /// Error message
        error: String,
        /// Error classification
        kind: ErrorKind,
        /// Failed attempts so far
        attempts: u32,
        /// Throw away offsets and validator (integrity failures)
        discard_partial: bool,
    },
    /// A transient failure that will be retried after a backoff
    RetryLater {
        /// Error message
        error: String,
        /// Failed attempts so far
        attempts: u32,
        /// When the task may be admitted again
        eligible_at: DateTime<Utc>,
    },
    /// Give the slot back without consuming an attempt (shutdown, crash recovery)
    Requeue,
    /// Manual re-enqueue of a failed task
    Restart,
}

impl Transition {
    /// Short operation name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Admit => "admit",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Cancel => "cancel",
            Transition::Complete => "complete",
            Transition::Fail { .. } => "fail",
            Transition::RetryLater { .. } => "retry_later",
            Transition::Requeue => "requeue",
            Transition::Restart => "restart",
        }
    }

    /// Whether the transition may be applied to a task in `from`
    pub fn allowed_from(&self, from: Status) -> bool {
        use Status::*;
        match self {
            Transition::Admit => from == Queued,
            Transition::Pause => matches!(from, Queued | Active),
            Transition::Resume => from == Paused,
            Transition::Cancel => matches!(from, Queued | Active | Paused | Failed),
            Transition::Complete
            | Transition::Fail { .. }
            | Transition::RetryLater { .. }
            | Transition::Requeue => from == Active,
            Transition::Restart => from == Failed,
        }
    }

    /// Status after the transition
    pub fn target(&self) -> Status {
        match self {
            Transition::Admit => Status::Active,
            Transition::Pause => Status::Paused,
            Transition::Resume
            | Transition::RetryLater { .. }
            | Transition::Requeue
            | Transition::Restart => Status::Queued,
            Transition::Cancel => Status::Cancelled,
            Transition::Complete => Status::Completed,
            Transition::Fail { .. } => Status::Failed,
        }
    }

    /// Apply the transition's effects to `record`
    ///
    /// The caller checks [`allowed_from`](Self::allowed_from) first and
    /// assigns a fresh sequence number for `Restart`.
    pub(crate) fn apply(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        record.status = self.target();
        record.updated_at = now;

        match self {
            Transition::Admit | Transition::Resume | Transition::Complete => {
                record.eligible_at = None;
            }
            Transition::Pause | Transition::Requeue => {}
            Transition::Cancel => {
                reset_partial(record);
                record.eligible_at = None;
            }
            Transition::Fail {
                error,
                kind,
                attempts,
                discard_partial,
            } => {
                record.last_error = Some(error.clone());
                record.last_error_kind = Some(*kind);
                record.attempt_count = *attempts;
                record.eligible_at = None;
                if *discard_partial {
                    reset_partial(record);
                }
            }
            Transition::RetryLater {
                error,
                attempts,
                eligible_at,
            } => {
                record.last_error = Some(error.clone());
                record.last_error_kind = Some(ErrorKind::Transient);
                record.attempt_count = *attempts;
                record.eligible_at = Some(*eligible_at);
            }
            Transition::Restart => {
                record.attempt_count = 0;
                record.last_error = None;
                record.last_error_kind = None;
                record.eligible_at = None;
            }
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn reset_partial(record: &mut TaskRecord) {
    record.bytes_downloaded = 0;
    record.resume_offset = 0;
    record.validator = None;
}

/// Progress reported by the worker owning a task
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Bytes flushed to the temp file; also becomes the resume offset
    pub bytes_downloaded: u64,
    /// Total size, if known
    pub total_bytes: Option<u64>,
    /// Validator of the resource being downloaded
    pub validator: Option<String>,
    /// The resource changed and the temp file was truncated to 0;
    /// also clears the attempt count
    pub restarted: bool,
}

impl ProgressUpdate {
    /// Update for a restart from byte 0 against a changed resource
    pub fn restart(total_bytes: Option<u64>, validator: Option<String>) -> Self {
        Self {
            bytes_downloaded: 0,
            total_bytes,
            validator,
            restarted: true,
        }
    }

    /// Checks the byte invariant; returns a description of the violation
    pub(crate) fn violation(&self, record: &TaskRecord) -> Option<String> {
        if let Some(total) = self.total_bytes
            && self.bytes_downloaded > total
        {
            return Some(format!(
                "bytes_downloaded {} exceeds total_bytes {total}",
                self.bytes_downloaded
            ));
        }
        if !self.restarted && self.bytes_downloaded < record.bytes_downloaded {
            return Some(format!(
                "bytes_downloaded went backwards from {} to {}",
                record.bytes_downloaded, self.bytes_downloaded
            ));
        }
        None
    }

    pub(crate) fn apply(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        record.bytes_downloaded = self.bytes_downloaded;
        record.resume_offset = self.bytes_downloaded;
        record.total_bytes = self.total_bytes;
        record.validator = self.validator.clone();
        if self.restarted {
            record.attempt_count = 0;
        }
        record.updated_at = now;
    }
}
