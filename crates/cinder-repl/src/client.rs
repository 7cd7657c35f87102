//! The replication client (slave side).
//!
//! One client replicates from one master. It runs a dedicated thread
//! hosting a mio poll loop that drives two step machines:
//!
//! - the **PSYNC machine**: AUTH → `_db_name` check → REPLCONF → PSYNC,
//!   then the endless increment-batch loop applying streamed batches;
//! - the **full-sync machine**: AUTH → `_fetch_meta` → backup id → size →
//!   content, after which the loop is torn down and the blocking file
//!   transfer runs, bracketed by the restore coordinator.
//!
//! The client owns its socket and machines exclusively; the host observes it
//! only through [`StatusCell`]. Transient failures reconnect with capped
//! exponential backoff; fatal failures (bad credentials, wrong database)
//! park the client in [`ReplState::Error`] until the host removes and
//! re-adds the master.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use cinder_storage::{decode_control, extract, peek_span, BackupMeta, ControlCode, StorageResult, UpdateRecord};
use cinder_types::{BackupId, ReplState, SequenceNumber};
use cinder_wire::{decode_reply, BatchStreamDecoder, Reply, Request};
use mio::{Events, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::ReplicationConfig;
use crate::coordinator::RestoreCoordinator;
use crate::error::{ReplError, ReplResult};
use crate::fetcher::{fetch_files, FetchObserver, FetchSpec};
use crate::machine::{Direction, MachineStatus, Step, StepMachine, StepOutcome, StepSocket};
use crate::NEED_FULL_SYNC_MARKER;

const CLIENT_TOKEN: Token = Token(0);

/// Poll tick; bounds how fast the client notices a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Host Capabilities
// ============================================================================

/// The capabilities the client needs from its host server.
///
/// Injected at construction; the client holds no other handle into the
/// server. `apply_batch` must commit atomically per batch and advance the
/// engine's sequence to the batch's last update.
pub trait ReplicaHost: Send + Sync {
    /// Applies one replicated batch byte-identically, returning the
    /// post-apply latest sequence.
    fn apply_batch(&self, payload: &[u8]) -> StorageResult<SequenceNumber>;

    /// The engine's latest applied sequence.
    fn latest_sequence(&self) -> SequenceNumber;

    /// Fans one replicated pubsub message out to local subscribers.
    fn publish(&self, channel: &[u8], message: &[u8]);

    /// Re-executes one propagated command (e.g. a script load).
    fn execute_propagated(&self, key: &[u8], value: &[u8]);

    /// Quiesces workers and closes storage ahead of a restore.
    fn pre_full_sync(&self);

    /// Reopens storage on the new backup (`succeeded`) or rolls back.
    fn post_full_sync(&self, succeeded: bool);

    /// A fetch worker came up (gauge hook).
    fn fetch_thread_started(&self) {}

    /// A fetch worker finished (gauge hook).
    fn fetch_thread_finished(&self) {}
}

// ============================================================================
// Shared Status
// ============================================================================

/// Snapshot of the client's observable state.
#[derive(Debug, Clone, Copy)]
pub struct SharedStatus {
    /// Current replication state.
    pub state: ReplState,
    /// Unix time of the last successful socket read or write.
    pub last_io_unix: u64,
}

/// Single-writer, many-reader cell holding the observable status.
///
/// Only the client thread writes; the host reads for introspection and for
/// the stale-read policy.
#[derive(Clone)]
pub struct StatusCell {
    inner: Arc<RwLock<SharedStatus>>,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SharedStatus {
                state: ReplState::Connecting,
                last_io_unix: 0,
            })),
        }
    }

    /// Current replication state.
    pub fn state(&self) -> ReplState {
        self.inner.read().map(|s| s.state).unwrap_or(ReplState::Error)
    }

    /// Unix time of the last successful socket I/O.
    pub fn last_io_time(&self) -> u64 {
        self.inner.read().map(|s| s.last_io_unix).unwrap_or(0)
    }

    fn set_state(&self, state: ReplState) {
        if let Ok(mut inner) = self.inner.write() {
            if inner.state != state {
                debug!(from = %inner.state, to = %state, "repl state transition");
                inner.state = state;
            }
        }
    }

    fn touch_io(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Ok(mut inner) = self.inner.write() {
            inner.last_io_unix = now;
        }
    }
}

impl std::fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCell")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Sync Flow (per-attempt handler context)
// ============================================================================

/// Mutable state threaded through the step handlers of one attempt.
pub(crate) struct SyncFlow {
    config: ReplicationConfig,
    host: Arc<dyn ReplicaHost>,
    status: StatusCell,
    batch_stream: BatchStreamDecoder,
    /// Set when the master (or an in-band control frame) demands a full sync.
    full_sync_requested: bool,
    // Full-sync meta accumulation.
    meta_id: Option<BackupId>,
    meta_size: Option<usize>,
    meta: Option<BackupMeta>,
}

impl SyncFlow {
    fn new(config: ReplicationConfig, host: Arc<dyn ReplicaHost>, status: StatusCell) -> Self {
        Self {
            config,
            host,
            status,
            batch_stream: BatchStreamDecoder::new(),
            full_sync_requested: false,
            meta_id: None,
            meta_size: None,
            meta: None,
        }
    }

    fn next_reply(&mut self, sock: &mut StepSocket) -> ReplResult<Option<Reply>> {
        Ok(decode_reply(&mut sock.read_buf)?)
    }

    // ------------------------------------------------------------------
    // Handshake steps (shared by both machines where noted)
    // ------------------------------------------------------------------

    fn send_auth(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(password) = self.config.masterauth.clone() else {
            return Ok(StepOutcome::Next); // no password configured
        };
        self.status.set_state(ReplState::SendAuth);
        let mut out = bytes::BytesMut::new();
        Request::Auth { password }.encode(&mut out);
        sock.queue(&out);
        Ok(StepOutcome::Next)
    }

    fn recv_auth(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        if self.config.masterauth.is_none() {
            return Ok(StepOutcome::Next); // no reply expected
        }
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        if reply.is_ok() {
            return Ok(StepOutcome::Next);
        }
        match reply.as_error() {
            Some(message) => Err(ReplError::Auth(message.to_string())),
            None => Err(ReplError::Protocol("unexpected AUTH reply".into())),
        }
    }

    fn send_db_name(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        self.status.set_state(ReplState::CheckDbName);
        let mut out = bytes::BytesMut::new();
        Request::DbName.encode(&mut out);
        sock.queue(&out);
        Ok(StepOutcome::Next)
    }

    fn recv_db_name(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        match reply {
            Reply::Bulk(name) => {
                let actual = String::from_utf8_lossy(&name).into_owned();
                if actual == self.config.namespace {
                    debug!(namespace = %actual, "db name verified");
                    Ok(StepOutcome::Next)
                } else {
                    Err(ReplError::DbNameMismatch {
                        expected: self.config.namespace.clone(),
                        actual,
                    })
                }
            }
            Reply::Error(message) if message.contains("NOAUTH") => Err(ReplError::Auth(message)),
            Reply::Error(message) => Err(ReplError::Protocol(message)),
            Reply::Simple(other) => Err(ReplError::Protocol(format!(
                "unexpected _db_name reply '+{other}'"
            ))),
        }
    }

    fn send_replconf(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        self.status.set_state(ReplState::ReplConf);
        let port = match self.config.listening_port {
            0 => sock.local_port().unwrap_or(0),
            configured => configured,
        };
        let mut out = bytes::BytesMut::new();
        Request::ReplConf {
            key: "listening-port".to_string(),
            value: port.to_string(),
        }
        .encode(&mut out);
        sock.queue(&out);
        Ok(StepOutcome::Next)
    }

    fn recv_replconf(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        if reply.is_ok() {
            return Ok(StepOutcome::Next);
        }
        match reply.as_error() {
            // Masters predating REPLCONF answer "unknown command"; that is
            // not a failure, the port announcement is advisory.
            Some(message) if message.contains("unknown command") => {
                debug!("master does not support REPLCONF, continuing");
                Ok(StepOutcome::Next)
            }
            Some(message) => Err(ReplError::Protocol(format!("REPLCONF rejected: {message}"))),
            None => Err(ReplError::Protocol("unexpected REPLCONF reply".into())),
        }
    }

    // ------------------------------------------------------------------
    // PSYNC steps
    // ------------------------------------------------------------------

    fn send_psync(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        self.status.set_state(ReplState::SendPsync);
        let next_seq = self.host.latest_sequence().next();
        info!(seq = %next_seq, "requesting incremental sync");
        let mut out = bytes::BytesMut::new();
        Request::Psync { next_seq }.encode(&mut out);
        sock.queue(&out);
        Ok(StepOutcome::Next)
    }

    fn recv_psync(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        if reply.is_ok() {
            self.batch_stream.reset();
            self.status.set_state(ReplState::Connected);
            info!("incremental replication established");
            return Ok(StepOutcome::Next);
        }
        match reply.as_error() {
            Some(message) if message.contains(NEED_FULL_SYNC_MARKER) => {
                warn!(reason = %message, "psync refused, falling back to full sync");
                self.full_sync_requested = true;
                Ok(StepOutcome::Quit)
            }
            Some(message) => Err(ReplError::Protocol(format!("PSYNC rejected: {message}"))),
            None => Err(ReplError::Protocol("unexpected PSYNC reply".into())),
        }
    }

    /// The increment-batch loop. Stays installed; never returns `Next`.
    fn batch_loop(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        loop {
            let Some(payload) = self.batch_stream.decode(&mut sock.read_buf)? else {
                return Ok(StepOutcome::Again);
            };
            self.apply_frame(&payload)?;
            if self.full_sync_requested {
                return Ok(StepOutcome::Quit);
            }
        }
    }

    /// Applies one streamed frame: storage first, then side effects.
    fn apply_frame(&mut self, payload: &[u8]) -> ReplResult<()> {
        if let Some(code) = decode_control(payload) {
            match code {
                ControlCode::RestartFullSync => {
                    warn!("master signalled restart, falling back to full sync");
                    self.full_sync_requested = true;
                    return Ok(());
                }
            }
        }

        let (first, count) = peek_span(payload)?;
        let applied = self.host.apply_batch(payload)?;

        // The engine's post-apply sequence must land exactly on the frame's
        // last update; anything else means the dense-sequence invariant is
        // broken on one side.
        let expected = first.advance(count - 1);
        if applied != expected {
            return Err(ReplError::Fatal(format!(
                "post-apply sequence {applied} does not match frame end {expected}"
            )));
        }

        for record in extract(payload)? {
            match record {
                UpdateRecord::Publish { channel, message } => {
                    self.host.publish(&channel, &message);
                }
                UpdateRecord::Propagate { key, value } => {
                    self.host.execute_propagated(&key, &value);
                }
            }
        }

        trace!(seq = %applied, "applied replicated batch");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Full-sync steps
    // ------------------------------------------------------------------

    fn send_fetch_meta(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        self.status.set_state(ReplState::FetchMeta);
        self.meta_id = None;
        self.meta_size = None;
        self.meta = None;
        let mut out = bytes::BytesMut::new();
        Request::FetchMeta.encode(&mut out);
        sock.queue(&out);
        Ok(StepOutcome::Next)
    }

    fn recv_meta_id(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        let id = parse_meta_number::<u32>(&reply, "backup id")?;
        self.meta_id = Some(BackupId::new(id));
        Ok(StepOutcome::Next)
    }

    fn recv_meta_size(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        let size = parse_meta_number::<usize>(&reply, "meta size")?;
        self.meta_size = Some(size);
        Ok(StepOutcome::Next)
    }

    fn recv_meta_content(&mut self, sock: &mut StepSocket) -> ReplResult<StepOutcome> {
        let Some(reply) = self.next_reply(sock)? else {
            return Ok(StepOutcome::Again);
        };
        let Reply::Bulk(content) = reply else {
            return Err(ReplError::Protocol("meta content is not a bulk".into()));
        };

        let expected_size = self.meta_size.unwrap_or(0);
        if content.len() != expected_size {
            return Err(ReplError::Protocol(format!(
                "meta content is {} bytes, master announced {expected_size}",
                content.len()
            )));
        }

        let id = self.meta_id.unwrap_or(BackupId::ZERO);
        let text = String::from_utf8_lossy(&content);
        let meta = BackupMeta::parse_text(id, &text)?;
        info!(id = %meta.id, files = meta.files.len(), "received backup meta");
        self.meta = Some(meta);
        Ok(StepOutcome::Next)
    }
}

fn parse_meta_number<T: std::str::FromStr>(reply: &Reply, what: &str) -> ReplResult<T> {
    let Reply::Bulk(bytes) = reply else {
        return Err(ReplError::Protocol(format!("{what} is not a bulk")));
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ReplError::Protocol(format!("{what} is not UTF-8")))?;
    text.trim()
        .parse()
        .map_err(|_| ReplError::Protocol(format!("bad {what} '{text}'")))
}

/// The PSYNC machine's step table.
fn psync_steps() -> Vec<Step<SyncFlow>> {
    vec![
        Step { direction: Direction::Write, name: "auth", run: SyncFlow::send_auth },
        Step { direction: Direction::Read, name: "auth-reply", run: SyncFlow::recv_auth },
        Step { direction: Direction::Write, name: "db-name", run: SyncFlow::send_db_name },
        Step { direction: Direction::Read, name: "db-name-reply", run: SyncFlow::recv_db_name },
        Step { direction: Direction::Write, name: "replconf", run: SyncFlow::send_replconf },
        Step { direction: Direction::Read, name: "replconf-reply", run: SyncFlow::recv_replconf },
        Step { direction: Direction::Write, name: "psync", run: SyncFlow::send_psync },
        Step { direction: Direction::Read, name: "psync-reply", run: SyncFlow::recv_psync },
        Step { direction: Direction::Read, name: "batch-loop", run: SyncFlow::batch_loop },
    ]
}

/// The full-sync machine's step table.
fn full_sync_steps() -> Vec<Step<SyncFlow>> {
    vec![
        Step { direction: Direction::Write, name: "auth", run: SyncFlow::send_auth },
        Step { direction: Direction::Read, name: "auth-reply", run: SyncFlow::recv_auth },
        Step { direction: Direction::Write, name: "fetch-meta", run: SyncFlow::send_fetch_meta },
        Step { direction: Direction::Read, name: "meta-id", run: SyncFlow::recv_meta_id },
        Step { direction: Direction::Read, name: "meta-size", run: SyncFlow::recv_meta_size },
        Step { direction: Direction::Read, name: "meta-content", run: SyncFlow::recv_meta_content },
    ]
}

// ============================================================================
// Replication Client
// ============================================================================

/// Handle to a running replication client.
///
/// Dropping the handle stops the client and joins its thread.
pub struct ReplicationClient {
    status: StatusCell,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReplicationClient {
    /// Starts replicating from the configured master.
    pub fn start(config: ReplicationConfig, host: Arc<dyn ReplicaHost>) -> ReplResult<Self> {
        let status = StatusCell::new();
        let stop = Arc::new(AtomicBool::new(false));

        let mut worker = ClientWorker {
            config,
            host,
            status: status.clone(),
            stop: Arc::clone(&stop),
            want_full_sync: false,
        };

        let thread = std::thread::Builder::new()
            .name("cinder-repl-client".to_string())
            .spawn(move || worker.run())
            .map_err(ReplError::Io)?;

        Ok(Self {
            status,
            stop,
            thread: Some(thread),
        })
    }

    /// Current replication state.
    pub fn state(&self) -> ReplState {
        self.status.state()
    }

    /// Unix time of the last successful replication I/O.
    pub fn last_io_time(&self) -> u64 {
        self.status.last_io_time()
    }

    /// A clone of the observable status cell.
    pub fn status(&self) -> StatusCell {
        self.status.clone()
    }

    /// Stops the client and joins its thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Client Worker
// ============================================================================

enum AttemptEnd {
    Stopped,
    Retry,
    FullSyncRequested,
    FullSyncComplete,
}

enum DriveEnd {
    Stopped,
    Done,
    Quit,
    Restart,
}

struct ClientWorker {
    config: ReplicationConfig,
    host: Arc<dyn ReplicaHost>,
    status: StatusCell,
    stop: Arc<AtomicBool>,
    want_full_sync: bool,
}

impl ClientWorker {
    fn run(&mut self) {
        info!(master = %self.config.master_addr, "replication client started");
        let mut backoff = Backoff::new(self.config.backoff_floor, self.config.backoff_ceiling);

        while !self.stopped() {
            self.status.set_state(ReplState::Connecting);

            let attempt = if self.want_full_sync {
                self.full_sync_attempt()
            } else {
                self.psync_attempt()
            };

            match attempt {
                Ok(AttemptEnd::Stopped) => break,
                Ok(AttemptEnd::FullSyncRequested) => {
                    self.want_full_sync = true;
                    backoff.reset();
                }
                Ok(AttemptEnd::FullSyncComplete) => {
                    self.want_full_sync = false;
                    backoff.reset();
                }
                Ok(AttemptEnd::Retry) => {
                    self.status.set_state(ReplState::Error);
                    self.sleep(backoff.next_delay());
                }
                Err(ReplError::Stopped) => break,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "replication halted; remove and re-add the master to retry");
                    self.status.set_state(ReplState::Error);
                    return;
                }
                Err(e) => {
                    // A drop out of live streaming starts the backoff over.
                    let was_connected = self.status.state() == ReplState::Connected;
                    warn!(error = %e, "replication attempt failed");
                    self.status.set_state(ReplState::Error);
                    if was_connected {
                        backoff.reset();
                    }
                    self.sleep(backoff.next_delay());
                }
            }
        }

        info!("replication client stopped");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL.min(duration));
        }
    }

    fn resolve(&self) -> ReplResult<SocketAddr> {
        let addr = &self.config.master_addr;
        addr.to_socket_addrs()
            .map_err(|source| ReplError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ReplError::Connect {
                addr: addr.clone(),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved"),
            })
    }

    fn open_socket(&self) -> ReplResult<StepSocket> {
        let addr = self.resolve()?;
        StepSocket::connect(addr).map_err(|source| ReplError::Connect {
            addr: self.config.master_addr.clone(),
            source,
        })
    }

    fn psync_attempt(&mut self) -> ReplResult<AttemptEnd> {
        let mut flow = SyncFlow::new(
            self.config.clone(),
            Arc::clone(&self.host),
            self.status.clone(),
        );
        let mut machine = StepMachine::new(psync_steps());
        let mut sock = self.open_socket()?;

        match self.drive(&mut machine, &mut flow, &mut sock)? {
            DriveEnd::Stopped => Ok(AttemptEnd::Stopped),
            DriveEnd::Restart => Ok(AttemptEnd::Retry),
            DriveEnd::Quit | DriveEnd::Done => {
                if flow.full_sync_requested {
                    Ok(AttemptEnd::FullSyncRequested)
                } else {
                    Err(ReplError::Protocol(
                        "replication stream ended unexpectedly".into(),
                    ))
                }
            }
        }
    }

    fn full_sync_attempt(&mut self) -> ReplResult<AttemptEnd> {
        let mut flow = SyncFlow::new(
            self.config.clone(),
            Arc::clone(&self.host),
            self.status.clone(),
        );
        let mut machine = StepMachine::new(full_sync_steps());
        let mut sock = self.open_socket()?;

        match self.drive(&mut machine, &mut flow, &mut sock)? {
            DriveEnd::Stopped => return Ok(AttemptEnd::Stopped),
            DriveEnd::Done => {}
            DriveEnd::Quit | DriveEnd::Restart => {
                return Err(ReplError::Protocol("meta fetch aborted".into()));
            }
        }

        // Tear down the event loop before the blocking transfer phase.
        drop(sock);

        let meta = flow
            .meta
            .take()
            .ok_or_else(|| ReplError::Protocol("meta fetch produced no meta".into()))?;

        self.status.set_state(ReplState::FetchFiles);
        info!(id = %meta.id, files = meta.files.len(), "starting full-sync file transfer");

        let coordinator = RestoreCoordinator::new(Arc::clone(&self.host));
        let guard = coordinator.begin();

        let spec = FetchSpec {
            master_addr: &self.config.master_addr,
            masterauth: self.config.masterauth.as_deref(),
            dest_dir: &self.config.backup_dir,
            files: &meta.files,
            threads: self.config.fetch_file_threads,
        };
        let observer = GaugeObserver {
            host: self.host.as_ref(),
        };

        match fetch_files(&spec, &self.stop, &observer) {
            Ok(()) => {
                guard.complete();
                info!(id = %meta.id, "full sync complete, re-entering psync");
                Ok(AttemptEnd::FullSyncComplete)
            }
            Err(e) => {
                drop(guard); // reports the failed restore
                Err(e)
            }
        }
    }

    /// Runs one machine over one socket until it finishes or fails.
    fn drive(
        &self,
        machine: &mut StepMachine<SyncFlow>,
        flow: &mut SyncFlow,
        sock: &mut StepSocket,
    ) -> ReplResult<DriveEnd> {
        let mut poll = Poll::new()?;
        sock.register(&poll, CLIENT_TOKEN)?;
        let mut events = Events::with_capacity(8);

        let connect_started = Instant::now();
        let mut connected = false;

        loop {
            if self.stopped() {
                return Ok(DriveEnd::Stopped);
            }

            let mut poll_result = poll.poll(&mut events, Some(POLL_INTERVAL));
            if let Err(ref e) = poll_result {
                if e.kind() == io::ErrorKind::Interrupted {
                    poll_result = Ok(());
                }
            }
            poll_result?;

            let mut readable = false;
            let mut writable = false;
            for event in events.iter() {
                if event.token() == CLIENT_TOKEN {
                    readable |= event.is_readable();
                    writable |= event.is_writable();
                }
            }

            if !connected {
                if readable || writable {
                    sock.confirm_connected().map_err(|source| ReplError::Connect {
                        addr: self.config.master_addr.clone(),
                        source,
                    })?;
                    connected = true;
                    debug!(master = %self.config.master_addr, "connected to master");
                } else if connect_started.elapsed() > self.config.connect_timeout {
                    return Err(ReplError::Connect {
                        addr: self.config.master_addr.clone(),
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    });
                } else {
                    continue;
                }
            }

            if readable {
                let n = sock.fill()?;
                if n > 0 {
                    self.status.touch_io();
                }
            }

            let status = machine.drive(flow, sock, readable)?;

            let flushed = sock.flush()?;
            if flushed > 0 {
                self.status.touch_io();
            }

            match status {
                MachineStatus::Running => {}
                MachineStatus::Done => return Ok(DriveEnd::Done),
                MachineStatus::Quit => return Ok(DriveEnd::Quit),
                MachineStatus::Restart => return Ok(DriveEnd::Restart),
            }

            sock.reregister(&poll, CLIENT_TOKEN)?;
        }
    }
}

/// Bridges fetch-worker lifecycle to the host's gauge.
struct GaugeObserver<'a> {
    host: &'a dyn ReplicaHost,
}

impl FetchObserver for GaugeObserver<'_> {
    fn file_fetched(&self, name: &str, crc32: u32) {
        debug!(file = name, crc = format_args!("{crc32:08x}"), "backup file fetched");
    }

    fn worker_started(&self) {
        self.host.fetch_thread_started();
    }

    fn worker_finished(&self) {
        self.host.fetch_thread_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::{encode_batch, encode_control, Engine, MemoryEngine, WriteBatch};
    use cinder_types::ColumnFamily;
    use cinder_wire::encode_batch_frame;
    use std::sync::Mutex;

    /// Records the order of host interactions.
    struct TestHost {
        engine: MemoryEngine,
        events: Mutex<Vec<String>>,
    }

    impl TestHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                engine: MemoryEngine::new(),
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ReplicaHost for TestHost {
        fn apply_batch(&self, payload: &[u8]) -> StorageResult<SequenceNumber> {
            let seq = self.engine.apply_batch(payload)?;
            self.events.lock().unwrap().push(format!("apply:{}", seq.as_u64()));
            Ok(seq)
        }
        fn latest_sequence(&self) -> SequenceNumber {
            self.engine.latest_sequence()
        }
        fn publish(&self, channel: &[u8], _message: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("publish:{}", String::from_utf8_lossy(channel)));
        }
        fn execute_propagated(&self, key: &[u8], _value: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("propagate:{}", String::from_utf8_lossy(key)));
        }
        fn pre_full_sync(&self) {
            self.events.lock().unwrap().push("pre".into());
        }
        fn post_full_sync(&self, succeeded: bool) {
            self.events.lock().unwrap().push(format!("post:{succeeded}"));
        }
    }

    fn test_flow(host: Arc<TestHost>) -> SyncFlow {
        let config = ReplicationConfig::new("127.0.0.1:1", "/tmp/unused");
        SyncFlow::new(config, host, StatusCell::new())
    }

    fn loopback_socket() -> (StepSocket, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (StepSocket::from_std(accepted).unwrap(), peer)
    }

    #[test]
    fn auth_steps_skip_without_password() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        assert_eq!(flow.send_auth(&mut sock).unwrap(), StepOutcome::Next);
        assert!(sock.write_buf.is_empty());
        assert_eq!(flow.recv_auth(&mut sock).unwrap(), StepOutcome::Next);
    }

    #[test]
    fn auth_error_is_fatal() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        flow.config.masterauth = Some("wrong".into());
        let (mut sock, _peer) = loopback_socket();

        sock.read_buf
            .extend_from_slice(b"-NOAUTH Authentication required.\r\n");
        let err = flow.recv_auth(&mut sock).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ReplError::Auth(_)));
    }

    #[test]
    fn db_name_mismatch_is_fatal() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        sock.read_buf.extend_from_slice(b"$5\r\nother\r\n");
        let err = flow.recv_db_name(&mut sock).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ReplError::DbNameMismatch { .. }));
    }

    #[test]
    fn replconf_tolerates_old_masters() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        sock.read_buf
            .extend_from_slice(b"-ERR unknown command 'REPLCONF'\r\n");
        assert_eq!(flow.recv_replconf(&mut sock).unwrap(), StepOutcome::Next);

        sock.read_buf.extend_from_slice(b"-ERR denied\r\n");
        assert!(flow.recv_replconf(&mut sock).is_err());
    }

    #[test]
    fn psync_refusal_requests_full_sync() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        sock.read_buf
            .extend_from_slice(b"-ERR sequence out of range, need full sync\r\n");
        assert_eq!(flow.recv_psync(&mut sock).unwrap(), StepOutcome::Quit);
        assert!(flow.full_sync_requested);
    }

    #[test]
    fn batch_loop_applies_storage_then_side_effects() {
        let host = TestHost::new();
        let mut flow = test_flow(Arc::clone(&host));
        let (mut sock, _peer) = loopback_socket();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, &b"k"[..], &b"v"[..]);
        batch.put(ColumnFamily::Pubsub, &b"news"[..], &b"hi"[..]);
        batch.put(ColumnFamily::Propagate, &b"script"[..], &b"body"[..]);
        let payload = encode_batch(SequenceNumber::new(1), &batch);

        encode_batch_frame(&payload, &mut sock.read_buf);
        assert_eq!(flow.batch_loop(&mut sock).unwrap(), StepOutcome::Again);

        assert_eq!(
            host.events(),
            vec!["apply:3", "publish:news", "propagate:script"]
        );
        assert_eq!(host.latest_sequence(), SequenceNumber::new(3));
    }

    #[test]
    fn control_frame_triggers_full_sync() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        let control = encode_control(ControlCode::RestartFullSync);
        encode_batch_frame(&control, &mut sock.read_buf);

        assert_eq!(flow.batch_loop(&mut sock).unwrap(), StepOutcome::Quit);
        assert!(flow.full_sync_requested);
    }

    #[test]
    fn sequence_divergence_is_fatal() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        // First frame claims sequence 5 against an empty engine.
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, &b"k"[..], &b"v"[..]);
        let payload = encode_batch(SequenceNumber::new(5), &batch);
        encode_batch_frame(&payload, &mut sock.read_buf);

        let err = flow.batch_loop(&mut sock).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn meta_steps_accumulate_backup_meta() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        let content = "a deadbeef\nb 00c0ffee\n";
        let size = content.len().to_string();
        sock.read_buf.extend_from_slice(b"$1\r\n7\r\n");
        sock.read_buf
            .extend_from_slice(format!("${}\r\n{}\r\n", size.len(), size).as_bytes());
        sock.read_buf
            .extend_from_slice(format!("${}\r\n{}\r\n", content.len(), content).as_bytes());

        assert_eq!(flow.recv_meta_id(&mut sock).unwrap(), StepOutcome::Next);
        assert_eq!(flow.recv_meta_size(&mut sock).unwrap(), StepOutcome::Next);
        assert_eq!(flow.recv_meta_content(&mut sock).unwrap(), StepOutcome::Next);

        let meta = flow.meta.unwrap();
        assert_eq!(meta.id, BackupId::new(7));
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].crc32, 0xdead_beef);
    }

    #[test]
    fn meta_size_mismatch_is_protocol_error() {
        let host = TestHost::new();
        let mut flow = test_flow(host);
        let (mut sock, _peer) = loopback_socket();

        flow.meta_id = Some(BackupId::new(1));
        flow.meta_size = Some(999);
        sock.read_buf.extend_from_slice(b"$4\r\na 00\r\n");
        // "a 00" is 4 bytes but meta_size says 999.
        assert!(flow.recv_meta_content(&mut sock).is_err());
    }
}
