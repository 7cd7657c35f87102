//! # cinder-wire: Redis wire codec for CinderKV replication
//!
//! This crate implements the subset of the Redis wire protocol the
//! replication subsystem speaks:
//!
//! - **Inline commands** - space-joined words terminated by CRLF
//!   (`AUTH secret`, `PSYNC 101`, `_fetch_file 000017.sst`)
//! - **Replies** - simple strings (`+OK`), errors (`-ERR ...`), and bulk
//!   strings (`$<n>\r\n<payload>\r\n`)
//! - **Batch frames** - the endless stream of bulk-framed write batches a
//!   master feeds a slave after `PSYNC` is accepted
//!
//! All decoders are incremental: they operate on a [`bytes::BytesMut`] fed
//! from a non-blocking socket, return `Ok(None)` when more data is needed,
//! and only consume input once a complete element is available. Bare
//! newlines between elements are liveness probes and are skipped.

pub mod command;
pub mod error;
pub mod reply;
pub mod stream;

pub use command::{decode_line, Request, MAX_LINE_LENGTH};
pub use error::{WireError, WireResult};
pub use reply::{decode_reply, parse_bulk_header, Reply, MAX_BULK_SIZE};
pub use stream::{encode_batch_frame, BatchStreamDecoder, LIVENESS_PROBE, MAX_BATCH_FRAME};
