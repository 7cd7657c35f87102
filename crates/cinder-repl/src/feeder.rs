//! The per-slave feeder (master side).
//!
//! One feeder owns one slave socket. It tails the engine's WAL from the
//! sequence the slave requested, wraps each batch in its bulk envelope, and
//! writes with bounded buffering: a flush happens once 16 batches or 16 KiB
//! are pending, or when the log head is reached. While the slave is caught
//! up the feeder sleeps with an adaptive interval and periodically writes a
//! one-byte probe so a dead peer is noticed.
//!
//! Feeders never retry. Any write failure, a write blocked past the
//! configured threshold, or a purge underneath the slave's position ends the
//! thread; the slave reconnects on its own (after a purge, into a full
//! sync, steered by an in-band control frame).

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use cinder_storage::{encode_control, ControlCode, Engine, StorageError, WalIterator};
use cinder_types::SequenceNumber;
use cinder_wire::{encode_batch_frame, LIVENESS_PROBE};
use tracing::{debug, info, warn};

use crate::config::FeederConfig;
use crate::error::{ReplError, ReplResult};

/// Sleep slice used so stop requests interrupt idle waits promptly.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to one slave's feeder thread.
///
/// The handle guarantees the thread is joined before it is dropped.
pub struct Feeder {
    stop: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    /// The next sequence the slave has not yet been sent.
    next_seq: Arc<AtomicU64>,
    peer: String,
    thread: Option<JoinHandle<()>>,
}

impl Feeder {
    /// Spawns a feeder streaming to `stream` from `next_repl_seq`.
    ///
    /// The caller has already validated that `next_repl_seq` is inside the
    /// engine's WAL window (or exactly at the head).
    pub fn spawn(
        stream: TcpStream,
        engine: Arc<dyn Engine>,
        next_repl_seq: SequenceNumber,
        config: FeederConfig,
    ) -> ReplResult<Self> {
        stream.set_write_timeout(Some(config.write_timeout))?;
        let _ = stream.set_nodelay(true);

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());

        let stop = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let next_seq = Arc::new(AtomicU64::new(next_repl_seq.as_u64()));

        let worker = FeederWorker {
            stream,
            engine,
            next_seq: next_repl_seq,
            config,
            stop: Arc::clone(&stop),
            seq_cell: Arc::clone(&next_seq),
            peer: peer.clone(),
        };
        let exited_flag = Arc::clone(&exited);

        let thread = std::thread::Builder::new()
            .name("cinder-feeder".to_string())
            .spawn(move || {
                worker.run();
                exited_flag.store(true, Ordering::SeqCst);
            })
            .map_err(ReplError::Io)?;

        info!(peer = %peer, seq = %next_repl_seq, "feeder attached");

        Ok(Self {
            stop,
            exited,
            next_seq,
            peer,
            thread: Some(thread),
        })
    }

    /// Asks the feeder to stop; the idle sleep is interrupted promptly.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Waits for the feeder thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Returns true once the feeder thread has exited (for reaping).
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// The last sequence sent to the slave (`ZERO` before anything was).
    pub fn current_repl_seq(&self) -> SequenceNumber {
        let next = self.next_seq.load(Ordering::SeqCst);
        if next == 0 {
            SequenceNumber::ZERO
        } else {
            SequenceNumber::new(next - 1)
        }
    }

    /// The slave's address, for introspection.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Flush policy: pending batches or bytes at (or past) a threshold flush.
fn should_flush(pending_updates: usize, pending_bytes: usize, config: &FeederConfig) -> bool {
    pending_updates >= config.max_delay_updates || pending_bytes >= config.max_delay_bytes
}

// ============================================================================
// Worker
// ============================================================================

struct FeederWorker {
    stream: TcpStream,
    engine: Arc<dyn Engine>,
    next_seq: SequenceNumber,
    config: FeederConfig,
    stop: Arc<AtomicBool>,
    seq_cell: Arc<AtomicU64>,
    peer: String,
}

impl FeederWorker {
    fn run(mut self) {
        match self.feed() {
            Ok(()) => info!(peer = %self.peer, "feeder exited"),
            Err(e) => warn!(peer = %self.peer, error = %e, "feeder terminated"),
        }
    }

    fn feed(&mut self) -> ReplResult<()> {
        let mut iter: Option<Box<dyn WalIterator>> = None;
        let mut buf = BytesMut::with_capacity(self.config.max_delay_bytes * 2);
        let mut pending = 0usize;
        let mut idle = self.config.idle_floor;
        let mut last_probe = Instant::now();

        while !self.stopped() {
            if iter.is_none() {
                match self.engine.wal_since(self.next_seq) {
                    Ok(it) => iter = Some(it),
                    Err(StorageError::SequencePurged { requested, oldest }) => {
                        return self.send_restart_control(requested, oldest);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let mut streamed_any = false;
            loop {
                let frame = match iter.as_mut().expect("iterator opened above").next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break, // caught up with the log head
                    Err(StorageError::SequencePurged { requested, oldest }) => {
                        return self.send_restart_control(requested, oldest);
                    }
                    Err(e) => return Err(e.into()),
                };

                debug_assert_eq!(frame.first_sequence, self.next_seq, "wal gap");

                encode_batch_frame(&frame.payload, &mut buf);
                pending += 1;
                self.next_seq = frame.next_sequence();
                self.seq_cell.store(self.next_seq.as_u64(), Ordering::SeqCst);
                streamed_any = true;

                if should_flush(pending, buf.len(), &self.config) {
                    self.flush(&mut buf, &mut pending)?;
                }

                if self.stopped() {
                    break;
                }
            }

            self.flush(&mut buf, &mut pending)?;

            if streamed_any {
                idle = self.config.idle_floor;
                continue;
            }

            // Caught up: probe the peer on a time basis, then sleep.
            if last_probe.elapsed() >= self.config.liveness_interval {
                self.stream.write_all(LIVENESS_PROBE)?;
                last_probe = Instant::now();
            }

            self.sleep(idle);
            idle = (idle + self.config.idle_floor).min(self.config.idle_ceiling);
        }

        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() && Instant::now() < deadline {
            std::thread::sleep(STOP_CHECK_INTERVAL.min(duration));
        }
    }

    /// Writes the pending frames. A write blocked past the configured
    /// timeout surfaces as an error and ends the feeder.
    fn flush(&mut self, buf: &mut BytesMut, pending: &mut usize) -> ReplResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let bytes = buf.len();
        self.stream.write_all(buf)?;
        buf.clear();
        *pending = 0;

        // Advisory rate ceiling, applied at flush time.
        if self.config.max_replication_mb > 0 {
            let budget = self.config.max_replication_mb as f64 * 1024.0 * 1024.0;
            let delay = Duration::from_secs_f64(bytes as f64 / budget);
            if delay > Duration::from_micros(500) {
                self.sleep(delay);
            }
        }
        Ok(())
    }

    /// Tells the slave its position is gone and it must full-sync.
    fn send_restart_control(
        &mut self,
        requested: SequenceNumber,
        oldest: SequenceNumber,
    ) -> ReplResult<()> {
        warn!(
            peer = %self.peer,
            requested = %requested,
            oldest = %oldest,
            "slave position purged from wal, instructing restart"
        );
        let control = encode_control(ControlCode::RestartFullSync);
        let mut frame = BytesMut::new();
        encode_batch_frame(&control, &mut frame);
        self.stream.write_all(&frame)?;
        debug!(peer = %self.peer, "restart control frame sent");
        Ok(())
    }
}
