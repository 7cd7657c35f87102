//! Storage error types.

use cinder_types::SequenceNumber;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A write batch failed to decode (truncated, or unknown version tag).
    #[error("corrupt write batch: {0}")]
    Corrupt(String),

    /// A write batch with no updates was submitted.
    #[error("write batch is empty")]
    EmptyBatch,

    /// The requested WAL position is older than the oldest retained entry.
    #[error("wal sequence {requested} purged (oldest retained is {oldest})")]
    SequencePurged {
        requested: SequenceNumber,
        oldest: SequenceNumber,
    },

    /// The requested WAL position is beyond the log head.
    #[error("wal sequence {requested} is beyond the log head {latest}")]
    SequenceAhead {
        requested: SequenceNumber,
        latest: SequenceNumber,
    },

    /// A replicated batch does not continue the local log.
    #[error("batch out of order: expected {expected}, got {actual}")]
    OutOfOrderBatch {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The engine handle is closed (restore in progress).
    #[error("engine is closed")]
    Closed,

    /// A backup manifest or meta list failed to parse.
    #[error("invalid backup meta: {0}")]
    InvalidBackupMeta(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
