//! Reply encoding and incremental decoding.
//!
//! Three reply forms are spoken on the replication channel:
//!
//! ```text
//! +OK\r\n                      simple string
//! -ERR something went wrong\r\n  error
//! $5\r\nhello\r\n              bulk string
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// Maximum bulk payload accepted by [`decode_reply`] (16 MiB).
///
/// Backup files are not decoded through this path; they are streamed by the
/// file fetcher, which enforces its own bounds.
pub const MAX_BULK_SIZE: u64 = 16 * 1024 * 1024;

/// One reply element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+...` simple string.
    Simple(String),
    /// `-...` error string.
    Error(String),
    /// `$<n>` bulk payload.
    Bulk(Bytes),
}

impl Reply {
    /// The canonical `+OK` reply.
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    /// Builds an error reply with the conventional `ERR` prefix.
    pub fn err(message: impl Into<String>) -> Self {
        Reply::Error(format!("ERR {}", message.into()))
    }

    /// Returns true for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s == "OK")
    }

    /// Returns the error text if this is an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Reply::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Returns the bulk payload if this is a bulk reply.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(payload) => Some(payload),
            _ => None,
        }
    }

    /// Encodes the reply onto a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Bulk(payload) => {
                buf.put_u8(b'$');
                buf.put_slice(payload.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(payload);
                buf.put_slice(b"\r\n");
            }
        }
    }
}

/// Discards liveness probes (bare `\n` / `\r\n`) at the front of the buffer.
fn skip_probes(buf: &mut BytesMut) {
    while let Some(&first) = buf.first() {
        if first == b'\n' {
            let _ = buf.split_to(1);
        } else if first == b'\r' && buf.get(1) == Some(&b'\n') {
            let _ = buf.split_to(2);
        } else if first == b'\r' && buf.len() == 1 {
            // Lone CR: could be the start of a probe, wait for more.
            break;
        } else {
            break;
        }
    }
}

/// Finds the newline terminating the element header starting at the front of
/// the buffer. Returns the index of the `\n`.
fn header_end(buf: &BytesMut) -> WireResult<Option<usize>> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(nl) => Ok(Some(nl)),
        None if buf.len() > crate::command::MAX_LINE_LENGTH => Err(WireError::LineTooLong {
            len: buf.len(),
            max: crate::command::MAX_LINE_LENGTH,
        }),
        None => Ok(None),
    }
}

/// Consumes a `$<n>\r\n` bulk header from the buffer.
///
/// Returns `Ok(None)` if the header is not complete yet. The payload itself
/// is left in the buffer. Liveness probes before the header are skipped.
pub fn parse_bulk_header(buf: &mut BytesMut) -> WireResult<Option<u64>> {
    skip_probes(buf);

    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != b'$' {
        return Err(WireError::malformed(
            "bulk header",
            format!("expected '$', got {:#04x}", first),
        ));
    }

    let Some(nl) = header_end(buf)? else {
        return Ok(None);
    };

    let header = buf.split_to(nl + 1);
    let digits = &header[1..nl];
    let digits = digits.strip_suffix(b"\r").unwrap_or(digits);
    let text = std::str::from_utf8(digits)
        .map_err(|_| WireError::malformed("bulk header", "length is not valid UTF-8"))?;
    let len: u64 = text
        .parse()
        .map_err(|_| WireError::malformed("bulk header", format!("bad length '{text}'")))?;
    Ok(Some(len))
}

/// Attempts to decode one reply from the buffer.
///
/// Returns `Ok(None)` when more data is needed. On success, the consumed
/// bytes are removed from the buffer.
pub fn decode_reply(buf: &mut BytesMut) -> WireResult<Option<Reply>> {
    skip_probes(buf);

    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match first {
        b'+' | b'-' => {
            let Some(nl) = header_end(buf)? else {
                return Ok(None);
            };
            let line = buf.split_to(nl + 1);
            let body = &line[1..nl];
            let body = body.strip_suffix(b"\r").unwrap_or(body);
            let text = std::str::from_utf8(body)
                .map_err(|_| WireError::malformed("reply", "not valid UTF-8"))?
                .to_string();
            Ok(Some(if first == b'+' {
                Reply::Simple(text)
            } else {
                Reply::Error(text)
            }))
        }
        b'$' => {
            // Peek the header without consuming, so a partial payload leaves
            // the buffer untouched for the next call.
            let Some(nl) = header_end(buf)? else {
                return Ok(None);
            };
            let digits = &buf[1..nl];
            let digits = digits.strip_suffix(b"\r").unwrap_or(digits);
            let text = std::str::from_utf8(digits)
                .map_err(|_| WireError::malformed("bulk header", "length is not valid UTF-8"))?;
            let len: u64 = text
                .parse()
                .map_err(|_| WireError::malformed("bulk header", format!("bad length '{text}'")))?;

            if len > MAX_BULK_SIZE {
                return Err(WireError::BulkTooLarge {
                    size: len,
                    max: MAX_BULK_SIZE,
                });
            }

            let total = nl + 1 + len as usize + 2;
            if buf.len() < total {
                return Ok(None);
            }

            let _ = buf.split_to(nl + 1);
            let payload = buf.split_to(len as usize).freeze();
            let crlf = buf.split_to(2);
            if &crlf[..] != b"\r\n" {
                return Err(WireError::malformed("bulk", "missing trailing CRLF"));
            }
            Ok(Some(Reply::Bulk(payload)))
        }
        other => Err(WireError::malformed(
            "reply",
            format!("unexpected leading byte {:#04x}", other),
        )),
    }
}
