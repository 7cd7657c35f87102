//! Incremental decoding of the post-PSYNC batch stream.
//!
//! After a master accepts `PSYNC` it streams write batches indefinitely,
//! each wrapped in a bulk envelope:
//!
//! ```text
//! $<n>\r\n<raw batch bytes>\r\n$<n>\r\n...
//! ```
//!
//! The decoder alternates between two states (awaiting the header, awaiting
//! the body) and tolerates bare newlines between frames - feeders write a
//! single `\n` as a liveness probe.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};
use crate::reply::parse_bulk_header;

/// Maximum batch frame payload (16 MiB).
pub const MAX_BATCH_FRAME: u64 = 16 * 1024 * 1024;

/// The liveness probe a feeder writes between frames.
pub const LIVENESS_PROBE: &[u8] = b"\n";

/// State of the stream decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Waiting for a `$<n>\r\n` header.
    AwaitingHeader,
    /// Header consumed; waiting for `len` payload bytes plus CRLF.
    AwaitingBody { len: usize },
}

/// Decodes the endless `$<n>\r\n<payload>\r\n` stream a feeder produces.
///
/// Call [`BatchStreamDecoder::decode`] repeatedly as socket data arrives;
/// each `Ok(Some(_))` is one raw write-batch payload. A framing error cannot
/// be recovered in-stream - the caller must disconnect and resynchronize by
/// reconnecting.
#[derive(Debug)]
pub struct BatchStreamDecoder {
    state: StreamState,
    max_size: u64,
}

impl Default for BatchStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStreamDecoder {
    /// Creates a decoder with the default frame ceiling.
    pub fn new() -> Self {
        Self {
            state: StreamState::AwaitingHeader,
            max_size: MAX_BATCH_FRAME,
        }
    }

    /// Creates a decoder with a custom frame ceiling.
    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            state: StreamState::AwaitingHeader,
            max_size,
        }
    }

    /// Attempts to extract the next batch payload from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(_)` if the stream is malformed (disconnect to resynchronize)
    pub fn decode(&mut self, buf: &mut BytesMut) -> WireResult<Option<Bytes>> {
        loop {
            match self.state {
                StreamState::AwaitingHeader => {
                    let Some(len) = parse_bulk_header(buf)? else {
                        return Ok(None);
                    };
                    if len > self.max_size {
                        return Err(WireError::BulkTooLarge {
                            size: len,
                            max: self.max_size,
                        });
                    }
                    self.state = StreamState::AwaitingBody { len: len as usize };
                }
                StreamState::AwaitingBody { len } => {
                    if buf.len() < len + 2 {
                        return Ok(None);
                    }
                    let payload = buf.split_to(len).freeze();
                    let crlf = buf.split_to(2);
                    if &crlf[..] != b"\r\n" {
                        return Err(WireError::malformed(
                            "batch frame",
                            "missing trailing CRLF",
                        ));
                    }
                    self.state = StreamState::AwaitingHeader;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Resets the decoder to expect a fresh header.
    pub fn reset(&mut self) {
        self.state = StreamState::AwaitingHeader;
    }
}

/// Wraps one raw batch payload in its bulk envelope.
pub fn encode_batch_frame(payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(b'$');
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_roundtrip() {
        let mut buf = BytesMut::new();
        encode_batch_frame(b"first", &mut buf);
        encode_batch_frame(b"second", &mut buf);

        let mut decoder = BatchStreamDecoder::new();
        assert_eq!(
            decoder.decode(&mut buf).unwrap().unwrap().as_ref(),
            b"first"
        );
        assert_eq!(
            decoder.decode(&mut buf).unwrap().unwrap().as_ref(),
            b"second"
        );
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_byte_at_a_time() {
        let mut wire = BytesMut::new();
        encode_batch_frame(b"payload", &mut wire);

        let mut decoder = BatchStreamDecoder::new();
        let mut buf = BytesMut::new();
        for (i, &byte) in wire.iter().enumerate() {
            buf.put_u8(byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i < wire.len() - 1 {
                assert!(result.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(result.unwrap().as_ref(), b"payload");
            }
        }
    }

    #[test]
    fn probes_between_frames() {
        let mut buf = BytesMut::new();
        encode_batch_frame(b"a", &mut buf);
        buf.put_slice(LIVENESS_PROBE);
        buf.put_slice(LIVENESS_PROBE);
        encode_batch_frame(b"b", &mut buf);

        let mut decoder = BatchStreamDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), b"a");
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), b"b");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = BatchStreamDecoder::with_max_size(8);
        let mut buf = BytesMut::new();
        encode_batch_frame(b"123456789", &mut buf);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::BulkTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_trailer_is_fatal() {
        let mut buf = BytesMut::from(&b"$3\r\nabcXY"[..]);
        let mut decoder = BatchStreamDecoder::new();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.is_fatal());
    }
}
