//! Server error types.

use cinder_repl::ReplError;
use cinder_storage::StorageError;
use cinder_wire::WireError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur on the replication endpoint.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error on a slave connection.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Replication core error (feeder spawn, etc).
    #[error("replication error: {0}")]
    Replication(#[from] ReplError),

    /// A slave asked for a backup file outside the staging directory.
    #[error("refusing backup file name '{0}'")]
    SuspiciousFileName(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
