//! The step state machine for multi-turn wire exchanges.
//!
//! A handshake is an ordered list of steps, each either a read or a write,
//! executed against a non-blocking socket as readiness events arrive. Each
//! step's handler steers the driver through its return value:
//!
//! - [`StepOutcome::Next`] - step finished, advance the cursor
//! - [`StepOutcome::Again`] - step needs more input, stay put
//! - [`StepOutcome::Quit`] - tear down, the flow decided to end here
//! - [`StepOutcome::Restart`] - rewind to step 0 and reconnect
//!
//! The machine owns only the step table and the cursor. The socket is owned
//! by the event loop and handed to handlers by `&mut` together with the flow
//! context, so no handler holds a back-pointer to anything.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Poll, Token};
use tracing::trace;

use crate::error::ReplResult;

/// Whether a step consumes input or produces output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A handler's verdict after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Advance to the next step.
    Next,
    /// Stay on this step; more input or buffer space is needed.
    Again,
    /// End the exchange here.
    Quit,
    /// Rewind to the first step and reconnect.
    Restart,
}

/// One step of an exchange.
pub struct Step<C> {
    /// Read or write.
    pub direction: Direction,
    /// Name for logging.
    pub name: &'static str,
    /// The handler. Plain function pointer: all state lives in `C`.
    pub run: fn(&mut C, &mut StepSocket) -> ReplResult<StepOutcome>,
}

/// Result of driving the machine over the currently available readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Waiting for more socket readiness.
    Running,
    /// All steps completed.
    Done,
    /// A handler ended the exchange.
    Quit,
    /// A handler requested a reconnect from step 0.
    Restart,
}

/// Drives an ordered step table over a [`StepSocket`].
pub struct StepMachine<C> {
    steps: Vec<Step<C>>,
    cursor: usize,
}

impl<C> StepMachine<C> {
    /// Creates a machine over the given steps.
    pub fn new(steps: Vec<Step<C>>) -> Self {
        debug_assert!(!steps.is_empty(), "machine needs at least one step");
        Self { steps, cursor: 0 }
    }

    /// Rewinds to the first step.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Name of the current step, for logging.
    pub fn current_step(&self) -> Option<&'static str> {
        self.steps.get(self.cursor).map(|s| s.name)
    }

    /// Runs as many steps as the buffered data allows.
    ///
    /// Write steps only queue bytes, so they always run. Read steps run when
    /// the read buffer holds data or a readable event just fired; a handler
    /// that cannot make progress returns [`StepOutcome::Again`] and the
    /// driver yields back to the poll loop.
    pub fn drive(
        &mut self,
        ctx: &mut C,
        sock: &mut StepSocket,
        readable: bool,
    ) -> ReplResult<MachineStatus> {
        loop {
            let Some(step) = self.steps.get(self.cursor) else {
                return Ok(MachineStatus::Done);
            };

            if step.direction == Direction::Read && sock.read_buf.is_empty() && !readable {
                return Ok(MachineStatus::Running);
            }

            trace!(step = step.name, "running step");
            match (step.run)(ctx, sock)? {
                StepOutcome::Next => {
                    self.cursor += 1;
                    if self.cursor == self.steps.len() {
                        return Ok(MachineStatus::Done);
                    }
                }
                StepOutcome::Again => return Ok(MachineStatus::Running),
                StepOutcome::Quit => return Ok(MachineStatus::Quit),
                StepOutcome::Restart => {
                    self.reset();
                    return Ok(MachineStatus::Restart);
                }
            }
        }
    }
}

// ============================================================================
// Step Socket
// ============================================================================

/// Read buffer capacity hint.
const READ_CHUNK: usize = 16 * 1024;

/// A non-blocking socket with its read and write buffers.
///
/// Handlers parse out of `read_buf` and queue into `write_buf`; the event
/// loop fills and flushes around them.
pub struct StepSocket {
    stream: TcpStream,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
}

impl StepSocket {
    /// Starts a non-blocking connect to the master.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::with_stream(stream))
    }

    /// Wraps an already-connected std stream (used by tests).
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::with_stream(TcpStream::from_std(stream)))
    }

    fn with_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Registers the socket with the poll for both directions.
    pub fn register(&mut self, poll: &Poll, token: Token) -> io::Result<()> {
        poll.registry()
            .register(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Narrows interest to what is actually pending.
    pub fn reregister(&mut self, poll: &Poll, token: Token) -> io::Result<()> {
        let interest = self.interest();
        poll.registry()
            .reregister(&mut self.stream, token, interest)
    }

    fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Returns an error if the non-blocking connect failed.
    ///
    /// Call on the first readiness event after `connect`.
    pub fn confirm_connected(&self) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        self.stream.peer_addr().map(|_| ())
    }

    /// The socket's local port (announced via REPLCONF when configured as 0).
    pub fn local_port(&self) -> Option<u16> {
        self.stream.local_addr().ok().map(|addr| addr.port())
    }

    /// Queues bytes for writing.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Reads everything currently available into the read buffer.
    ///
    /// Returns the number of bytes read; a peer close surfaces as
    /// `UnexpectedEof`.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "master closed the connection",
                    ));
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of the write buffer as the socket accepts.
    ///
    /// Returns the number of bytes flushed.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to master",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
