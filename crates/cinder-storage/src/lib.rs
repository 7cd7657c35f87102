//! # cinder-storage: storage contract and write-batch codec
//!
//! The replication subsystem treats the storage engine as an opaque
//! collaborator reached through the [`Engine`] trait: it can report its
//! latest sequence number, tail its write-ahead log, create and restore
//! backups, and apply raw replicated batches. This crate defines that
//! contract, the versioned write-batch byte format both sides agree on,
//! the update extractor that classifies replicated batches, and an
//! in-memory engine used by tests and single-node development.
//!
//! ## Write-batch format
//!
//! ```text
//! ┌─────────┬────────────────┬──────────┬──────────────────────────┐
//! │ version │ first_sequence │  count   │        entries...        │
//! │  (1B)   │   (8B, LE)     │ (4B, LE) │                          │
//! └─────────┴────────────────┴──────────┴──────────────────────────┘
//! entry: [op:1B][cf:1B][key_len:4B LE][key][val_len:4B LE][val]
//!        (deletes omit the value length and value)
//! ```
//!
//! Version `0` is reserved for control frames a feeder uses to steer its
//! slave in-band (currently only "restart replication with a full sync").

pub mod backup;
pub mod batch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod memory;

pub use backup::{BackupFileEntry, BackupMeta, Manifest, MANIFEST_FILE};
pub use batch::{
    decode_batch, decode_control, encode_batch, encode_control, peek_span, BatchOp, ControlCode,
    DecodedBatch, WriteBatch, BATCH_FORMAT_VERSION, CONTROL_FORMAT_VERSION,
};
pub use engine::{Engine, WalFrame, WalIterator};
pub use error::{StorageError, StorageResult};
pub use extract::{extract, UpdateRecord};
pub use memory::MemoryEngine;
