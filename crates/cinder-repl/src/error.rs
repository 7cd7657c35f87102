//! Replication error types.

use std::io;

use cinder_storage::StorageError;
use cinder_wire::WireError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
///
/// Transient errors are absorbed by the client's reconnect loop with capped
/// exponential backoff. Fatal errors ([`ReplError::is_fatal`]) halt the
/// retry loop and require host intervention (remove and re-add the master).
#[derive(Debug, Error)]
pub enum ReplError {
    /// TCP-level connection failure.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The master rejected our credentials. Fatal until the password is
    /// corrected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The master serves a different logical database. Fatal: prevents
    /// cross-database replication.
    #[error("db name mismatch: expected '{expected}', master is '{actual}'")]
    DbNameMismatch { expected: String, actual: String },

    /// Malformed frame or unexpected reply; reconnect to resynchronize.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A fetched file's CRC did not match the meta list; the full sync is
    /// retried from scratch.
    #[error("crc mismatch for '{name}': expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    /// An invariant the protocol guarantees was violated locally.
    #[error("fatal replication fault: {0}")]
    Fatal(String),

    /// The client (or fetcher) was asked to stop.
    #[error("replication stopped")]
    Stopped,

    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Storage engine failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transient I/O failure; reconnect.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ReplError {
    /// Returns true if retrying cannot help and the host must intervene.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplError::Auth(_)
                | ReplError::DbNameMismatch { .. }
                | ReplError::Fatal(_)
                | ReplError::Storage(StorageError::OutOfOrderBatch { .. })
        )
    }
}
