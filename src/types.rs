//! Core types for resumable-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for TaskId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for TaskId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Task status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for an admission slot
    Queued,
    /// Owned by a transfer worker
    Active,
    /// Paused by the caller, resumable
    Paused,
    /// Transferred and renamed into place
    Completed,
    /// Gave up after a permanent error or exhausted retries
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl Status {
    /// Convert integer status code to Status enum
    ///
    /// Returns `None` for codes this version does not know about.
    pub fn from_i32(status: i32) -> Option<Self> {
        match status {
            0 => Some(Status::Queued),
            1 => Some(Status::Active),
            2 => Some(Status::Paused),
            3 => Some(Status::Completed),
            4 => Some(Status::Failed),
            5 => Some(Status::Cancelled),
            _ => None,
        }
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Queued => 0,
            Status::Active => 1,
            Status::Paused => 2,
            Status::Completed => 3,
            Status::Failed => 4,
            Status::Cancelled => 5,
        }
    }

    /// Completed and Cancelled tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Active => "active",
            Status::Paused => "paused",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classification of a transfer failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected to resolve by itself; retried with backoff
    Transient,
    /// The remote resource changed; restart from byte 0 without consuming an attempt
    ValidatorStale,
    /// Retrying will not help
    Permanent,
    /// Local storage cannot accept writes; halts new admissions
    StorageFatal,
}

impl ErrorKind {
    /// Convert ErrorKind to its persisted string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::ValidatorStale => "validator_stale",
            ErrorKind::Permanent => "permanent",
            ErrorKind::StorageFatal => "storage_fatal",
        }
    }

    /// Parse the persisted string form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient" => Some(ErrorKind::Transient),
            "validator_stale" => Some(ErrorKind::ValidatorStale),
            "permanent" => Some(ErrorKind::Permanent),
            "storage_fatal" => Some(ErrorKind::StorageFatal),
            _ => None,
        }
    }
}

/// Byte progress of a task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes flushed to the temp file
    pub bytes_downloaded: u64,
    /// Total size, once the server reported it
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Percentage complete, if the total is known
    pub fn percent(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64 * 100.0) as f32),
            None => None,
        }
    }
}

/// Full record of a download task
///
/// This is both the in-memory representation held by the task store and the
/// unit of persistence: one record per task, containing every field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task ID, immutable
    pub id: TaskId,
    /// Source URL, immutable
    pub source_url: String,
    /// Final path of the downloaded file, immutable
    pub destination_path: PathBuf,
    /// Current status
    pub status: Status,
    /// Bytes flushed so far
    pub bytes_downloaded: u64,
    /// Total size (persisted as -1 while unknown)
    pub total_bytes: Option<u64>,
    /// Offset to request on resume; equals `bytes_downloaded` of the last flush
    pub resume_offset: u64,
    /// Resource version token (ETag or Last-Modified) captured on first response
    pub validator: Option<String>,
    /// Failed attempts counted against the retry budget
    pub attempt_count: u32,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Classification of the most recent failure
    pub last_error_kind: Option<ErrorKind>,
    /// Higher is served first
    pub priority: i32,
    /// Enqueue order, used to break priority ties (FIFO)
    pub sequence: i64,
    /// Earliest time the scheduler may admit this task again (after a retry)
    pub eligible_at: Option<DateTime<Utc>>,
    /// Expected lowercase hex SHA-256 digest of the complete file
    pub expected_sha256: Option<String>,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Current byte progress
    pub fn progress(&self) -> Progress {
        Progress {
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
        }
    }

    /// Whether the scheduler may admit this task at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::Queued && self.eligible_at.is_none_or(|at| at <= now)
    }
}

/// Options for a new download task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Source URL (http or https)
    pub url: String,
    /// Final path of the downloaded file
    pub destination: PathBuf,
    /// Priority (higher first, default 0)
    #[serde(default)]
    pub priority: i32,
    /// Expected hex SHA-256 digest (either case), verified before the final rename
    #[serde(default)]
    pub expected_sha256: Option<String>,
}

impl TaskOptions {
    /// Options for `url` saved to `destination` at default priority
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the expected SHA-256 digest
    pub fn sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }
}

/// Filter for listing tasks
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    /// Only tasks in one of these states (empty = any)
    pub statuses: Vec<Status>,
    /// Only tasks with at least this priority
    pub min_priority: Option<i32>,
}

impl TaskFilter {
    /// Match every task
    pub fn all() -> Self {
        Self::default()
    }

    /// Match tasks in a single state
    pub fn status(status: Status) -> Self {
        Self {
            statuses: vec![status],
            min_priority: None,
        }
    }

    /// Whether `record` passes this filter
    pub fn matches(&self, record: &TaskRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self.min_priority.is_none_or(|min| record.priority >= min)
    }
}

/// A single state change of a task, delivered to event sinks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskChange {
    /// Task ID
    pub id: TaskId,
    /// Status before the change (`None` when the task was just created)
    pub old_status: Option<Status>,
    /// Status after the change
    pub new_status: Status,
    /// Progress after the change
    pub progress: Progress,
}

/// Event emitted by the download manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A task was created or mutated (status transition or progress flush)
    TaskChanged(TaskChange),

    /// A task record was deleted
    TaskRemoved {
        /// Task ID
        id: TaskId,
    },

    /// A transfer failed and will be retried
    RetryScheduled {
        /// Task ID
        id: TaskId,
        /// Attempt number that failed
        attempt: u32,
        /// Delay before the task becomes eligible again
        delay_ms: u64,
        /// Error message
        error: String,
    },

    /// The remote resource changed and the transfer restarted from byte 0
    TransferRestarted {
        /// Task ID
        id: TaskId,
    },

    /// New admissions are blocked until storage is available again
    AdmissionHalted {
        /// Why admissions stopped
        reason: String,
    },

    /// Admissions resumed after a storage halt
    AdmissionResumed,

    /// All queued tasks were paused
    QueuePaused,

    /// All paused tasks were resumed
    QueueResumed,

    /// The manager shut down
    Shutdown,
}
