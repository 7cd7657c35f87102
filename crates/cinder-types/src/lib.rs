//! Core types shared across the CinderKV workspace.
//!
//! This crate defines the fundamental identifiers used by the storage and
//! replication layers:
//! - [`SequenceNumber`] - Dense, monotonically increasing write-batch sequence
//! - [`BackupId`] - Monotonic identifier of a storage snapshot
//! - [`ColumnFamily`] - Storage namespace a mutation belongs to
//! - [`ReplState`] - Observable state of a replication client

use std::fmt::Display;

use serde::{Deserialize, Serialize};

// ============================================================================
// Sequence Number - Copy (8-byte value)
// ============================================================================

/// Sequence number of a write in the storage engine's log.
///
/// The engine assigns sequence numbers densely: a batch of `n` updates
/// occupies `n` consecutive sequence numbers, and the batch's sequence is the
/// first of them. Replication relies on this density to detect gaps.
///
/// # Invariants
///
/// - Sequence numbers are totally ordered and never reused
/// - `ZERO` means "nothing has been written yet"; the first update is `seq#1`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The sequence before any write (empty engine).
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Creates a sequence number.
    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the sequence number as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> Self {
        SequenceNumber(self.0.saturating_add(1))
    }

    /// Returns the sequence advanced past `count` updates.
    pub fn advance(&self, count: u32) -> Self {
        SequenceNumber(self.0.saturating_add(u64::from(count)))
    }

    /// Returns true if this is the zero sequence (nothing written).
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

// ============================================================================
// Backup Identifier - Copy (4-byte value)
// ============================================================================

/// Monotonically increasing identifier of a storage snapshot on a master.
///
/// A new backup supersedes all previous ones; slaves only ever fetch the
/// latest. The id is carried in the `_fetch_meta` reply so a slave can log
/// which snapshot it restored from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BackupId(u32);

impl BackupId {
    /// The id before any backup has been created.
    pub const ZERO: BackupId = BackupId(0);

    /// Creates a backup id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the id as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the next backup id.
    pub fn next(&self) -> Self {
        BackupId(self.0.saturating_add(1))
    }
}

impl Display for BackupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backup#{}", self.0)
    }
}

impl From<u32> for BackupId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ============================================================================
// Column Family - Copy (single byte on the wire)
// ============================================================================

/// Storage namespace a mutation belongs to.
///
/// Replication treats two families specially: puts in [`ColumnFamily::Pubsub`]
/// are re-published to subscribers on the slave, and puts in
/// [`ColumnFamily::Propagate`] are re-executed as commands rather than applied
/// as raw writes. Everything else is opaque engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ColumnFamily {
    /// Ordinary key-value data.
    #[default]
    Default,

    /// Pubsub messages written by the master so they replicate in-order
    /// with the data they relate to.
    Pubsub,

    /// Commands that must be re-executed on the slave (e.g. script loads).
    Propagate,
}

impl ColumnFamily {
    /// Returns the wire tag of the family.
    pub fn as_u8(&self) -> u8 {
        match self {
            ColumnFamily::Default => 0,
            ColumnFamily::Pubsub => 1,
            ColumnFamily::Propagate => 2,
        }
    }

    /// Looks up a family by wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ColumnFamily::Default),
            1 => Some(ColumnFamily::Pubsub),
            2 => Some(ColumnFamily::Propagate),
            _ => None,
        }
    }

    /// Returns the family's human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Pubsub => "pubsub",
            ColumnFamily::Propagate => "propagate",
        }
    }

    /// All families, in wire-tag order.
    pub const ALL: [ColumnFamily; 3] = [
        ColumnFamily::Default,
        ColumnFamily::Pubsub,
        ColumnFamily::Propagate,
    ];
}

impl Display for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Replication Client State
// ============================================================================

/// Observable state of a replication client.
///
/// Written only by the client thread; read by the host for introspection and
/// for the stale-read policy. Transitions are strictly forward within one
/// session except `Error -> Connecting` (retry after backoff) and
/// `Connected -> Connecting` (reconnect after an I/O failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplState {
    /// Establishing the TCP connection to the master.
    #[default]
    Connecting,

    /// Sending `AUTH` (skipped when no password is configured).
    SendAuth,

    /// Verifying the master serves the expected logical database.
    CheckDbName,

    /// Announcing the local listening port via `REPLCONF`.
    ReplConf,

    /// Requesting incremental sync with `PSYNC`.
    SendPsync,

    /// Fetching the backup meta list (full sync).
    FetchMeta,

    /// Downloading backup files (full sync).
    FetchFiles,

    /// Incremental streaming is live.
    Connected,

    /// Replication halted; host intervention may be required.
    Error,
}

impl ReplState {
    /// Returns true if incremental streaming is live.
    pub fn is_connected(&self) -> bool {
        matches!(self, ReplState::Connected)
    }

    /// Returns true if the host should answer reads in this state.
    ///
    /// When `serve_stale_data` is disabled, only a fully caught-up slave
    /// answers reads.
    pub fn serving_reads(&self, serve_stale_data: bool) -> bool {
        serve_stale_data || self.is_connected()
    }
}

impl Display for ReplState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplState::Connecting => "connecting",
            ReplState::SendAuth => "send-auth",
            ReplState::CheckDbName => "check-db-name",
            ReplState::ReplConf => "replconf",
            ReplState::SendPsync => "send-psync",
            ReplState::FetchMeta => "fetch-meta",
            ReplState::FetchFiles => "fetch-files",
            ReplState::Connected => "connected",
            ReplState::Error => "error",
        };
        f.write_str(name)
    }
}
