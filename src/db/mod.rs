//! Database layer for resumable-dl
//!
//! SQLite persistence for task records, one row per task.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`tasks`] - Task row CRUD and the [`PersistenceAdapter`](crate::persistence::PersistenceAdapter) impl

use crate::error::DatabaseError;
use crate::types::{ErrorKind, Status, TaskId, TaskRecord};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod migrations;
mod tasks;

/// Task row as stored in SQLite
///
/// Unsigned counters are stored as `INTEGER` (i64); `total_bytes` is `-1`
/// while unknown. Timestamps are unix milliseconds.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    /// Task ID
    pub id: i64,
    /// Source URL
    pub source_url: String,
    /// Destination path
    pub destination_path: String,
    /// Status code (see [`Status::to_i32`])
    pub status: i32,
    /// Bytes flushed so far
    pub bytes_downloaded: i64,
    /// Total size, `-1` when unknown
    pub total_bytes: i64,
    /// Offset to resume from
    pub resume_offset: i64,
    /// ETag or Last-Modified
    pub validator: Option<String>,
    /// Failed attempts
    pub attempt_count: i64,
    /// Last error message
    pub last_error: Option<String>,
    /// Last error classification (see [`ErrorKind::as_str`])
    pub last_error_kind: Option<String>,
    /// Priority
    pub priority: i32,
    /// Enqueue order
    pub sequence: i64,
    /// Retry eligibility time
    pub eligible_at: Option<i64>,
    /// Expected SHA-256 digest
    pub expected_sha256: Option<String>,
    /// Creation time
    pub created_at: i64,
    /// Last mutation time
    pub updated_at: i64,
}

impl From<&TaskRecord> for TaskRow {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id.0,
            source_url: record.source_url.clone(),
            destination_path: record.destination_path.to_string_lossy().into_owned(),
            status: record.status.to_i32(),
            bytes_downloaded: record.bytes_downloaded as i64,
            total_bytes: record.total_bytes.map_or(-1, |total| total as i64),
            resume_offset: record.resume_offset as i64,
            validator: record.validator.clone(),
            attempt_count: i64::from(record.attempt_count),
            last_error: record.last_error.clone(),
            last_error_kind: record.last_error_kind.map(|k| k.as_str().to_string()),
            priority: record.priority,
            sequence: record.sequence,
            eligible_at: record.eligible_at.map(|at| at.timestamp_millis()),
            expected_sha256: record.expected_sha256.clone(),
            created_at: record.created_at.timestamp_millis(),
            updated_at: record.updated_at.timestamp_millis(),
        }
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| DatabaseError::CorruptRecord { id, reason };
        let unsigned = |field: &str, value: i64| {
            u64::try_from(value).map_err(|_| corrupt(format!("negative {field}: {value}")))
        };
        let timestamp = |field: &str, millis: i64| {
            DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| corrupt(format!("{field} out of range: {millis}")))
        };

        let status = Status::from_i32(row.status)
            .ok_or_else(|| corrupt(format!("unknown status code {}", row.status)))?;
        let last_error_kind = match row.last_error_kind.as_deref() {
            Some(kind) => Some(
                ErrorKind::parse(kind).ok_or_else(|| corrupt(format!("unknown error kind {kind}")))?,
            ),
            None => None,
        };
        let total_bytes = match row.total_bytes {
            -1 => None,
            total => Some(unsigned("total_bytes", total)?),
        };
        let eligible_at = match row.eligible_at {
            Some(millis) => Some(timestamp("eligible_at", millis)?),
            None => None,
        };

        Ok(TaskRecord {
            id: TaskId(row.id),
            source_url: row.source_url,
            destination_path: PathBuf::from(row.destination_path),
            status,
            bytes_downloaded: unsigned("bytes_downloaded", row.bytes_downloaded)?,
            total_bytes,
            resume_offset: unsigned("resume_offset", row.resume_offset)?,
            validator: row.validator,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|_| corrupt(format!("attempt_count out of range: {}", row.attempt_count)))?,
            last_error: row.last_error,
            last_error_kind,
            priority: row.priority,
            sequence: row.sequence,
            eligible_at,
            expected_sha256: row.expected_sha256,
            created_at: timestamp("created_at", row.created_at)?,
            updated_at: timestamp("updated_at", row.updated_at)?,
        })
    }
}

/// Database handle for resumable-dl
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
