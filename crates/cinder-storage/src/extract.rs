//! Update extraction from replicated write batches.
//!
//! A slave applies every replicated batch to its engine wholesale, then asks
//! the extractor which updates carry replication side effects: puts in the
//! pubsub family are re-published to local subscribers, and puts in the
//! propagate family are re-executed as commands. Deletes in those families
//! are bookkeeping (the master trimming its own queues) and carry no payload
//! for the slave.

use bytes::Bytes;
use cinder_types::ColumnFamily;

use crate::batch::{decode_batch, BatchOp};
use crate::error::StorageResult;

/// A replication side effect extracted from one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRecord {
    /// Re-publish a message to local pubsub subscribers.
    Publish { channel: Bytes, message: Bytes },

    /// Re-execute a propagated command on the local server.
    Propagate { key: Bytes, value: Bytes },
}

/// Extracts the side-effect updates from a serialized write batch.
///
/// Updates are returned in batch order. Fails with
/// [`crate::StorageError::Corrupt`] if the batch is truncated or carries an
/// unrecognized version tag.
pub fn extract(payload: &[u8]) -> StorageResult<Vec<UpdateRecord>> {
    let batch = decode_batch(payload)?;

    let records = batch
        .ops
        .into_iter()
        .filter_map(|op| match op {
            BatchOp::Put {
                cf: ColumnFamily::Pubsub,
                key,
                value,
            } => Some(UpdateRecord::Publish {
                channel: key,
                message: value,
            }),
            BatchOp::Put {
                cf: ColumnFamily::Propagate,
                key,
                value,
            } => Some(UpdateRecord::Propagate { key, value }),
            _ => None,
        })
        .collect();

    Ok(records)
}
