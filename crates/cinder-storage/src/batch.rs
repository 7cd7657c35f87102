//! The versioned write-batch byte format.
//!
//! Batches are encoded once by the master and applied byte-identically by
//! every slave, so the format is part of the replication protocol. See the
//! crate docs for the layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cinder_types::{ColumnFamily, SequenceNumber};

use crate::error::{StorageError, StorageResult};

/// Current write-batch format version.
pub const BATCH_FORMAT_VERSION: u8 = 1;

/// Version tag reserved for in-band control frames.
pub const CONTROL_FORMAT_VERSION: u8 = 0;

/// Fixed header size: version + first_sequence + count.
const BATCH_HEADER_SIZE: usize = 1 + 8 + 4;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

// ============================================================================
// Control Frames
// ============================================================================

/// In-band control instructions a feeder can send instead of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// The slave's position was purged from the master's WAL; the slave must
    /// restart replication and fall back to a full sync.
    RestartFullSync,
}

impl ControlCode {
    fn as_u8(self) -> u8 {
        match self {
            ControlCode::RestartFullSync => 1,
        }
    }

    fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(ControlCode::RestartFullSync),
            _ => None,
        }
    }
}

/// Encodes a control frame payload.
pub fn encode_control(code: ControlCode) -> Bytes {
    Bytes::from(vec![CONTROL_FORMAT_VERSION, code.as_u8()])
}

/// Returns the control code if the payload is a control frame.
///
/// Returns `None` for ordinary batches; unknown control codes decode to
/// `None` as well so future codes degrade to a framing error downstream
/// rather than silent misbehavior.
pub fn decode_control(payload: &[u8]) -> Option<ControlCode> {
    if payload.len() == 2 && payload[0] == CONTROL_FORMAT_VERSION {
        ControlCode::from_u8(payload[1])
    } else {
        None
    }
}

// ============================================================================
// Batch Operations
// ============================================================================

/// One update inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        cf: ColumnFamily,
        key: Bytes,
        value: Bytes,
    },
    /// Remove a key.
    Delete { cf: ColumnFamily, key: Bytes },
}

impl BatchOp {
    /// Returns the column family the operation touches.
    pub fn column_family(&self) -> ColumnFamily {
        match self {
            BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => *cf,
        }
    }
}

/// A batch of updates under construction, before the engine assigns its
/// sequence number.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.ops.push(BatchOp::Put {
            cf,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Appends a delete.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Bytes>) {
        self.ops.push(BatchOp::Delete {
            cf,
            key: key.into(),
        });
    }

    /// Number of updates in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no updates.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The batch's operations.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// A decoded write batch with its assigned sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    /// Sequence of the first update in the batch.
    pub first_sequence: SequenceNumber,
    /// The updates, in application order.
    pub ops: Vec<BatchOp>,
}

impl DecodedBatch {
    /// Number of updates (the sequence span of the batch).
    pub fn update_count(&self) -> u32 {
        self.ops.len() as u32
    }

    /// Sequence of the last update in the batch.
    pub fn last_sequence(&self) -> SequenceNumber {
        debug_assert!(!self.ops.is_empty(), "decoded batch cannot be empty");
        self.first_sequence.advance(self.update_count() - 1)
    }
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Serializes a batch under its assigned first sequence.
pub fn encode_batch(first_sequence: SequenceNumber, batch: &WriteBatch) -> Bytes {
    let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE + 32 * batch.len());
    buf.put_u8(BATCH_FORMAT_VERSION);
    buf.put_u64_le(first_sequence.as_u64());
    buf.put_u32_le(batch.len() as u32);

    for op in &batch.ops {
        match op {
            BatchOp::Put { cf, key, value } => {
                buf.put_u8(OP_PUT);
                buf.put_u8(cf.as_u8());
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            BatchOp::Delete { cf, key } => {
                buf.put_u8(OP_DELETE);
                buf.put_u8(cf.as_u8());
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
            }
        }
    }

    buf.freeze()
}

/// Reads the batch header without decoding the entries.
///
/// Returns `(first_sequence, update_count)`. Control frames and corrupt
/// headers are errors.
pub fn peek_span(payload: &[u8]) -> StorageResult<(SequenceNumber, u32)> {
    if payload.len() < BATCH_HEADER_SIZE {
        return Err(StorageError::Corrupt(format!(
            "batch header truncated: {} bytes",
            payload.len()
        )));
    }

    let mut buf = payload;
    let version = buf.get_u8();
    if version != BATCH_FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unknown batch version {version}"
        )));
    }

    let first_sequence = SequenceNumber::new(buf.get_u64_le());
    let count = buf.get_u32_le();
    if count == 0 {
        return Err(StorageError::EmptyBatch);
    }

    Ok((first_sequence, count))
}

/// Decodes a complete write batch.
pub fn decode_batch(payload: &[u8]) -> StorageResult<DecodedBatch> {
    let (first_sequence, count) = peek_span(payload)?;

    let mut buf = &payload[BATCH_HEADER_SIZE..];
    let mut ops = Vec::with_capacity(count as usize);

    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(StorageError::Corrupt("entry header truncated".into()));
        }
        let op = buf.get_u8();
        let cf_tag = buf.get_u8();
        let cf = ColumnFamily::from_u8(cf_tag)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown column family tag {cf_tag}")))?;

        let key = take_chunk(&mut buf, "key")?;
        match op {
            OP_PUT => {
                let value = take_chunk(&mut buf, "value")?;
                ops.push(BatchOp::Put { cf, key, value });
            }
            OP_DELETE => ops.push(BatchOp::Delete { cf, key }),
            other => {
                return Err(StorageError::Corrupt(format!("unknown op tag {other}")));
            }
        }
    }

    if buf.has_remaining() {
        return Err(StorageError::Corrupt(format!(
            "{} trailing bytes after last entry",
            buf.remaining()
        )));
    }

    Ok(DecodedBatch {
        first_sequence,
        ops,
    })
}

fn take_chunk(buf: &mut &[u8], what: &str) -> StorageResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(StorageError::Corrupt(format!("{what} length truncated")));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StorageError::Corrupt(format!(
            "{what} truncated: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let chunk = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(chunk)
}
