//! The replication listener.
//!
//! Accepts slave connections on a dedicated port and hands each to a
//! handler thread. Handler threads either serve the connection to
//! completion or upgrade it into a feeder on PSYNC.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ServerResult;
use crate::handler::handle_connection;
use crate::service::MasterService;

/// Accept-loop poll interval; bounds shutdown latency.
const ACCEPT_TICK: Duration = Duration::from_millis(25);

/// A running replication listener.
///
/// Dropping the handle stops the accept loop and disconnects all slaves.
pub struct ReplicationListener {
    local_addr: SocketAddr,
    service: Arc<MasterService>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReplicationListener {
    /// Binds `bind_addr` and starts accepting slave connections.
    pub fn start(service: Arc<MasterService>, bind_addr: &str) -> ServerResult<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let accept_service = Arc::clone(&service);
        let accept_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("cinder-repl-listener".to_string())
            .spawn(move || accept_loop(listener, accept_service, accept_stop))?;

        info!(addr = %local_addr, "replication listener started");

        Ok(Self {
            local_addr,
            service,
            stop,
            thread: Some(thread),
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, joins the accept loop, and disconnects slaves.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.service.disconnect_slaves();
    }
}

impl Drop for ReplicationListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, service: Arc<MasterService>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let service = Arc::clone(&service);
                let stop = Arc::clone(&stop);
                let spawned = std::thread::Builder::new()
                    .name("cinder-repl-conn".to_string())
                    .spawn(move || handle_connection(service, stream, peer, stop));
                if let Err(e) = spawned {
                    warn!(error = %e, "failed to spawn connection handler");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_TICK);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_TICK);
            }
        }
    }
    info!("replication listener stopped");
}
