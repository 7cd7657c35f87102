//! # cinder-repl: master-slave replication for CinderKV
//!
//! This crate implements both halves of CinderKV's replication protocol:
//!
//! ```text
//!                    slave                                   master
//! ┌──────────────────────────────────────┐    ┌──────────────────────────────┐
//! │ ReplicationClient (dedicated thread) │    │ Feeder (one thread per slave)│
//! ├──────────────────────────────────────┤    ├──────────────────────────────┤
//! │ 1. connect, drive handshake steps    │───►│ accepts PSYNC at a sequence  │
//! │    (AUTH, _db_name, REPLCONF, PSYNC) │    │ tails the engine's WAL       │
//! │ 2. apply streamed batches in order   │◄───│ frames batches as $<n>\r\n.. │
//! │ 3. on refusal: full sync             │    │ paces flushes, probes peer   │
//! │    (_fetch_meta → fetch files → swap)│    │ dies on purge or write stall │
//! └──────────────────────────────────────┘    └──────────────────────────────┘
//! ```
//!
//! # Threading Model
//!
//! The client runs a mio poll loop in its own thread; no handler blocks.
//! The one blocking phase - downloading backup files - happens only after
//! the event loop for that attempt is torn down, on the same thread, with
//! `fetch_file_threads` transient workers doing the transfers. Feeders are
//! plain blocking writer threads, one per slave, owned by the master side.
//!
//! # Key Components
//!
//! - [`machine`]: the ordered step table driven by socket readiness
//! - [`client`]: the replication client and its host capability trait
//! - [`feeder`]: per-slave WAL streaming with pacing and liveness probing
//! - [`fetcher`]: sharded parallel backup-file download with CRC checks
//! - [`coordinator`]: the matched pre/post restore bracket

pub mod backoff;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod feeder;
pub mod fetcher;
pub mod machine;

pub use backoff::Backoff;
pub use client::{ReplicaHost, ReplicationClient, SharedStatus, StatusCell};
pub use config::{FeederConfig, ReplicationConfig};
pub use coordinator::{RestoreCoordinator, RestoreGuard};
pub use error::{ReplError, ReplResult};
pub use feeder::Feeder;
pub use fetcher::{fetch_files, FetchObserver, FetchSpec, NullObserver};
pub use machine::{Direction, MachineStatus, Step, StepMachine, StepOutcome, StepSocket};

/// Substring a master's PSYNC refusal carries when the slave must fall back
/// to a full sync. Detection is substring-based so wording may evolve around
/// it.
pub const NEED_FULL_SYNC_MARKER: &str = "need full sync";
