//! Error types for resumable-dl
//!
//! This module provides:
//! - The crate-level [`Error`] returned by the control surface and the task store
//! - [`DatabaseError`] for the SQLite persistence layer
//! - [`TransferError`] for failures inside a transfer, classified by [`ErrorKind`]
//! - [`ErrorCode`], the machine-readable result code of a control operation

use crate::types::{ErrorKind, Status, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for resumable-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for resumable-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.max_concurrent_downloads")
        key: Option<String>,
    },

    /// No task with this id exists
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The requested transition is not allowed from the task's current state
    #[error("cannot {transition} task {id} in state {from}")]
    InvalidTransition {
        /// The task the transition was attempted on
        id: TaskId,
        /// The state that prevents the transition
        from: Status,
        /// Name of the attempted transition (e.g., "pause", "complete")
        transition: &'static str,
    },

    /// The persistence adapter rejected a write; the in-memory state was not changed
    #[error("storage error: {0}")]
    Storage(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller supplied input that can never be served (bad URL, bad checksum, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Free space on the temp volume is below the configured minimum
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Bytes that must be free
        required: u64,
        /// Bytes that are free
        available: u64,
    },

    /// Free space could not be determined
    #[error("disk space check failed: {0}")]
    DiskSpaceCheckFailed(String),

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Transfer failure
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A stored row could not be turned back into a task record
    #[error("corrupt task record {id}: {reason}")]
    CorruptRecord {
        /// Row id
        id: i64,
        /// What was wrong with the row
        reason: String,
    },
}

/// Failure of a single transfer attempt
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Could not establish the connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connect or read timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// The response body stream broke off
    #[error("body stream error: {0}")]
    Stream(String),

    /// Server answered with a status the worker cannot use
    #[error("HTTP status {status}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
    },

    /// Server rejected the conditional request (412)
    #[error("precondition failed: resource changed")]
    PreconditionFailed,

    /// Server rejected the range (416)
    #[error("range not satisfiable at offset {offset}")]
    RangeNotSatisfiable {
        /// Requested start offset
        offset: u64,
    },

    /// The resource changed since the stored validator was captured
    #[error("validator changed: stored {stored:?}, server {current:?}")]
    ValidatorChanged {
        /// Validator held by the task
        stored: Option<String>,
        /// Validator the server sent
        current: Option<String>,
    },

    /// The server answered a range request with a partial response starting elsewhere
    #[error("content range mismatch: requested {requested}, got {actual}")]
    ContentRangeMismatch {
        /// Requested start offset
        requested: u64,
        /// Start offset the server reported
        actual: u64,
    },

    /// The server ignored the range request for an unchanged resource
    #[error("server does not support range requests")]
    RangeUnsupported,

    /// The url is malformed or uses a scheme the transport cannot fetch
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Total bytes received differ from the announced length
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Announced length
        expected: u64,
        /// Bytes on disk
        actual: u64,
    },

    /// The finished file does not hash to the expected digest
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected lowercase hex digest
        expected: String,
        /// Computed lowercase hex digest
        actual: String,
    },

    /// The stale-restart limit was hit within one admission
    #[error("resource changed {0} times during one admission")]
    TooManyRestarts(u32),

    /// Local storage cannot accept writes (disk full, permissions, read-only, quota)
    #[error("storage unavailable: {0}")]
    StorageFull(String),

    /// Other local I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransferError {
    /// Classify this failure for the retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Connect(_)
            | TransferError::Timeout(_)
            | TransferError::Stream(_)
            | TransferError::ContentRangeMismatch { .. }
            | TransferError::TooManyRestarts(_)
            | TransferError::Io(_) => ErrorKind::Transient,

            TransferError::HttpStatus { status } => match status {
                408 | 429 => ErrorKind::Transient,
                412 => ErrorKind::ValidatorStale,
                500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },

            TransferError::PreconditionFailed | TransferError::ValidatorChanged { .. } => {
                ErrorKind::ValidatorStale
            }

            TransferError::RangeNotSatisfiable { offset } if *offset > 0 => {
                ErrorKind::ValidatorStale
            }
            TransferError::RangeNotSatisfiable { .. } => ErrorKind::Permanent,

            TransferError::RangeUnsupported
            | TransferError::InvalidUrl(_)
            | TransferError::LengthMismatch { .. }
            | TransferError::ChecksumMismatch { .. } => ErrorKind::Permanent,

            TransferError::StorageFull(_) => ErrorKind::StorageFatal,
        }
    }

    /// Whether the temp file and persisted offsets must be thrown away
    pub fn discards_partial(&self) -> bool {
        matches!(
            self,
            TransferError::LengthMismatch { .. } | TransferError::ChecksumMismatch { .. }
        )
    }

    /// Classify a local I/O error from writing the temp file or destination
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::StorageFull | Io::PermissionDenied | Io::ReadOnlyFilesystem | Io::QuotaExceeded => {
                TransferError::StorageFull(err.to_string())
            }
            _ => TransferError::Io(err.to_string()),
        }
    }
}

/// Machine-readable result code of a control operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No task with the given id
    NotFound,
    /// The operation is not allowed in the task's current state
    InvalidTransition,
    /// Persistence or local storage failed
    StorageError,
    /// The manager is shutting down
    ShuttingDown,
    /// The input was rejected
    InvalidRequest,
    /// A transfer failed
    TransferFailed,
}

impl ErrorCode {
    /// String form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::StorageError => "storage_error",
            ErrorCode::ShuttingDown => "shutting_down",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::TransferFailed => "transfer_failed",
        }
    }
}

impl Error {
    /// Result code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Error::Storage(_)
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Io(_)
            | Error::InsufficientSpace { .. }
            | Error::DiskSpaceCheckFailed(_) => ErrorCode::StorageError,
            Error::Config { .. } | Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            Error::Transfer(e) if e.kind() == ErrorKind::StorageFatal => ErrorCode::StorageError,
            Error::Transfer(_) => ErrorCode::TransferFailed,
        }
    }

    /// The persistence layer failed the operation; the same write may succeed later
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Database(_) | Error::Sqlx(_) | Error::Io(_)
        )
    }
}
