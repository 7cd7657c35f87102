//! The storage engine contract replication is written against.
//!
//! The real engine is an external collaborator; replication only needs the
//! narrow surface below. [`crate::MemoryEngine`] implements it for tests and
//! single-node development.

use std::path::Path;

use bytes::Bytes;
use cinder_types::{ColumnFamily, SequenceNumber};

use crate::backup::BackupMeta;
use crate::batch::WriteBatch;
use crate::error::StorageResult;

/// One write batch as it appears in the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    /// Sequence of the first update in the batch.
    pub first_sequence: SequenceNumber,
    /// Number of updates (the batch's sequence span).
    pub update_count: u32,
    /// The serialized batch, byte-identical to what was committed.
    pub payload: Bytes,
}

impl WalFrame {
    /// Sequence of the last update in the batch.
    pub fn last_sequence(&self) -> SequenceNumber {
        debug_assert!(self.update_count > 0, "wal frame cannot be empty");
        self.first_sequence.advance(self.update_count - 1)
    }

    /// Sequence the next frame starts at.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.first_sequence.advance(self.update_count)
    }
}

/// A cursor over the WAL from a given sequence.
///
/// Iterators are independent snapshots: multiple feeders may tail the same
/// WAL concurrently. The engine keeps a frame reachable as long as it has
/// not been purged; a purge underneath an open iterator surfaces as
/// [`crate::StorageError::SequencePurged`] on the next read.
pub trait WalIterator: Send {
    /// Returns the next frame, `Ok(None)` when caught up with the log head.
    fn next_frame(&mut self) -> StorageResult<Option<WalFrame>>;
}

/// The narrow engine surface replication depends on.
///
/// Implementations must be thread-safe; the one exception is the restore
/// window bracketed by the host's pre/post full-sync callbacks, during which
/// the engine is exclusively held (see `close`/`restore_from`).
pub trait Engine: Send + Sync {
    /// Sequence of the most recently applied update (`ZERO` when empty).
    fn latest_sequence(&self) -> SequenceNumber;

    /// Oldest sequence still retained in the WAL.
    fn first_wal_sequence(&self) -> SequenceNumber;

    /// Commits a locally originated batch, assigning it the next sequences.
    ///
    /// Returns the sequence of the last update written.
    fn write(&self, batch: WriteBatch) -> StorageResult<SequenceNumber>;

    /// Applies a replicated batch byte-identically.
    ///
    /// The batch must continue the local log exactly
    /// (`first_sequence == latest_sequence + 1`); anything else is
    /// [`crate::StorageError::OutOfOrderBatch`]. Returns the post-apply
    /// latest sequence. Application is atomic per batch.
    fn apply_batch(&self, payload: &[u8]) -> StorageResult<SequenceNumber>;

    /// Opens a WAL cursor positioned at `from`.
    ///
    /// `from` may be `latest_sequence + 1` (a caught-up cursor).
    fn wal_since(&self, from: SequenceNumber) -> StorageResult<Box<dyn WalIterator>>;

    /// Point lookup, for reads and tests. `None` when absent or closed.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Bytes>;

    /// Writes a consistent snapshot of the engine into `dir` and returns its
    /// meta list (including the `MANIFEST`).
    fn create_backup(&self, dir: &Path) -> StorageResult<BackupMeta>;

    /// Reopens the engine from a freshly fetched backup directory.
    ///
    /// Only valid while closed; clears the WAL and resumes sequencing from
    /// the manifest's sequence.
    fn restore_from(&self, dir: &Path) -> StorageResult<()>;

    /// Closes the engine handle ahead of a restore. Subsequent writes fail
    /// with [`crate::StorageError::Closed`] until `restore_from` or `reopen`
    /// succeeds.
    fn close(&self);

    /// Reopens the engine on its previous state after an aborted restore.
    fn reopen(&self);
}
