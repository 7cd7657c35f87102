//! Per-connection request handling on the replication endpoint.
//!
//! One blocking thread serves one slave connection until it closes, errors,
//! or upgrades into a feeder via PSYNC. Requests arrive as inline command
//! lines; replies use the simple/error/bulk forms.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use cinder_types::SequenceNumber;
use cinder_wire::{decode_line, Reply, Request, WireError};
use tracing::{debug, warn};

use crate::error::ServerResult;
use crate::service::MasterService;

/// Read timeout so handler threads notice a listener shutdown.
const READ_TICK: Duration = Duration::from_millis(500);

/// Serves one slave connection to completion.
pub(crate) fn handle_connection(
    service: Arc<MasterService>,
    mut stream: TcpStream,
    peer: SocketAddr,
    stop: Arc<AtomicBool>,
) {
    debug!(peer = %peer, "replication connection opened");
    match serve(&service, &mut stream, &stop) {
        Ok(Some(next_seq)) => {
            // PSYNC accepted: the socket becomes a feeder's.
            let _ = stream.set_read_timeout(None);
            if let Err(e) = service.add_slave(stream, next_seq) {
                warn!(peer = %peer, error = %e, "failed to attach feeder");
            }
        }
        Ok(None) => debug!(peer = %peer, "replication connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "replication connection failed"),
    }
}

/// Returns `Ok(Some(seq))` when a PSYNC was accepted and the socket should
/// be handed to a feeder.
fn serve(
    service: &MasterService,
    stream: &mut TcpStream,
    stop: &AtomicBool,
) -> ServerResult<Option<SequenceNumber>> {
    stream.set_read_timeout(Some(READ_TICK))?;

    let config = service.config();
    let mut authed = config.requirepass.is_none();
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let mut chunk = [0u8; 4 * 1024];

    loop {
        let line = match decode_line(&mut buf)? {
            Some(line) => line,
            None => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                match stream.read(&mut chunk) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        continue;
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(WireError::UnknownCommand(name)) => {
                write_reply(stream, &Reply::err(format!("unknown command '{name}'")))?;
                continue;
            }
            Err(e) => {
                write_reply(stream, &Reply::err(e.to_string()))?;
                return Err(e.into());
            }
        };

        if !authed && !matches!(request, Request::Auth { .. }) {
            write_reply(
                stream,
                &Reply::Error("NOAUTH Authentication required.".to_string()),
            )?;
            continue;
        }

        match request {
            Request::Auth { password } => {
                if config.requirepass.as_deref() == Some(password.as_str()) {
                    authed = true;
                    write_reply(stream, &Reply::ok())?;
                } else if config.requirepass.is_none() {
                    write_reply(
                        stream,
                        &Reply::err("Client sent AUTH, but no password is set"),
                    )?;
                } else {
                    write_reply(stream, &Reply::err("invalid password"))?;
                }
            }

            Request::DbName => {
                write_reply(
                    stream,
                    &Reply::Bulk(bytes::Bytes::from(config.namespace.clone())),
                )?;
            }

            Request::ReplConf { key, value } => {
                if key.eq_ignore_ascii_case("listening-port") && value.parse::<u16>().is_ok() {
                    write_reply(stream, &Reply::ok())?;
                } else {
                    write_reply(stream, &Reply::err(format!("unknown REPLCONF option '{key}'")))?;
                }
            }

            Request::Psync { next_seq } => {
                if service.psync_in_range(next_seq) {
                    write_reply(stream, &Reply::ok())?;
                    return Ok(Some(next_seq));
                }
                debug!(
                    seq = %next_seq,
                    first = %service.engine().first_wal_sequence(),
                    latest = %service.engine().latest_sequence(),
                    "psync out of range"
                );
                write_reply(
                    stream,
                    &Reply::err("sequence out of range, need full sync"),
                )?;
            }

            Request::FetchMeta => match service.prepare_backup() {
                Ok(meta) => {
                    let content = meta.to_text();
                    let mut out = BytesMut::new();
                    Reply::Bulk(bytes::Bytes::from(meta.id.as_u32().to_string()))
                        .encode(&mut out);
                    Reply::Bulk(bytes::Bytes::from(content.len().to_string())).encode(&mut out);
                    Reply::Bulk(bytes::Bytes::from(content)).encode(&mut out);
                    stream.write_all(&out)?;
                }
                Err(e) => {
                    warn!(error = %e, "backup staging failed");
                    write_reply(stream, &Reply::err(format!("backup failed: {e}")))?;
                }
            },

            Request::FetchFile { name } => match service.read_backup_file(&name) {
                Ok(content) => {
                    write_reply(stream, &Reply::Bulk(bytes::Bytes::from(content)))?;
                }
                Err(e) => {
                    debug!(file = %name, error = %e, "fetch_file refused");
                    write_reply(stream, &Reply::err(format!("no such file '{name}'")))?;
                }
            },
        }
    }
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> ServerResult<()> {
    let mut out = BytesMut::new();
    reply.encode(&mut out);
    stream.write_all(&out)?;
    Ok(())
}
