//! Inline command encoding and parsing.
//!
//! Replication commands travel as inline commands: space-joined words
//! terminated by CRLF. This is the request half of the protocol; replies are
//! handled by [`crate::reply`].

use bytes::{BufMut, BytesMut};
use cinder_types::SequenceNumber;

use crate::error::{WireError, WireResult};

/// Maximum length of one inline command line.
pub const MAX_LINE_LENGTH: usize = 4 * 1024;

/// A replication request, as sent by a slave to its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `AUTH <password>` - authenticate against `requirepass`.
    Auth { password: String },

    /// `_db_name` - ask for the master's logical database name.
    DbName,

    /// `REPLCONF <key> <value>` - announce slave properties
    /// (currently only `listening-port`).
    ReplConf { key: String, value: String },

    /// `PSYNC <next-seq>` - request incremental sync from a sequence.
    Psync { next_seq: SequenceNumber },

    /// `_fetch_meta` - request the latest backup's meta list.
    FetchMeta,

    /// `_fetch_file <name>` - request one backup file's contents.
    FetchFile { name: String },
}

impl Request {
    /// Encodes the request as an inline command line.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Request::Auth { password } => {
                buf.put_slice(b"AUTH ");
                buf.put_slice(password.as_bytes());
            }
            Request::DbName => buf.put_slice(b"_db_name"),
            Request::ReplConf { key, value } => {
                buf.put_slice(b"REPLCONF ");
                buf.put_slice(key.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(value.as_bytes());
            }
            Request::Psync { next_seq } => {
                buf.put_slice(b"PSYNC ");
                buf.put_slice(next_seq.as_u64().to_string().as_bytes());
            }
            Request::FetchMeta => buf.put_slice(b"_fetch_meta"),
            Request::FetchFile { name } => {
                buf.put_slice(b"_fetch_file ");
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
    }

    /// Parses an inline command line into a request.
    ///
    /// Command names are matched case-insensitively, as Redis does.
    pub fn parse(line: &str) -> WireResult<Self> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(WireError::malformed("command", "empty line"));
        };

        let request = match name.to_ascii_lowercase().as_str() {
            "auth" => Request::Auth {
                password: required_arg(&mut words, "AUTH", "password")?.to_string(),
            },
            "_db_name" => Request::DbName,
            "replconf" => Request::ReplConf {
                key: required_arg(&mut words, "REPLCONF", "key")?.to_string(),
                value: required_arg(&mut words, "REPLCONF", "value")?.to_string(),
            },
            "psync" => {
                let seq = required_arg(&mut words, "PSYNC", "sequence")?;
                let seq: u64 = seq.parse().map_err(|_| {
                    WireError::malformed("command", format!("bad PSYNC sequence '{seq}'"))
                })?;
                Request::Psync {
                    next_seq: SequenceNumber::new(seq),
                }
            }
            "_fetch_meta" => Request::FetchMeta,
            "_fetch_file" => Request::FetchFile {
                name: required_arg(&mut words, "_fetch_file", "name")?.to_string(),
            },
            _ => return Err(WireError::UnknownCommand(name.to_string())),
        };

        if words.next().is_some() {
            return Err(WireError::malformed(
                "command",
                format!("trailing arguments after {name}"),
            ));
        }

        Ok(request)
    }
}

fn required_arg<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &str,
    what: &str,
) -> WireResult<&'a str> {
    words
        .next()
        .ok_or_else(|| WireError::malformed("command", format!("{command} missing {what}")))
}

/// Extracts one inline command line from the buffer.
///
/// Returns `Ok(None)` if no complete line is buffered yet. Blank lines
/// (liveness probes) are skipped. The terminating CRLF (or bare LF) is
/// consumed but not returned.
pub fn decode_line(buf: &mut BytesMut) -> WireResult<Option<String>> {
    loop {
        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_LINE_LENGTH {
                return Err(WireError::LineTooLong {
                    len: buf.len(),
                    max: MAX_LINE_LENGTH,
                });
            }
            return Ok(None);
        };

        if nl > MAX_LINE_LENGTH {
            return Err(WireError::LineTooLong {
                len: nl,
                max: MAX_LINE_LENGTH,
            });
        }

        let line = buf.split_to(nl + 1);
        let line = &line[..nl];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue; // blank line between commands
        }

        let line = std::str::from_utf8(line)
            .map_err(|_| WireError::malformed("command", "line is not valid UTF-8"))?;
        return Ok(Some(line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(request: Request) {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        let line = decode_line(&mut buf).expect("decode").expect("complete");
        assert_eq!(Request::parse(&line).expect("parse"), request);
        assert!(buf.is_empty());
    }

    #[test]
    fn request_roundtrips() {
        roundtrip(Request::Auth {
            password: "s3cret".into(),
        });
        roundtrip(Request::DbName);
        roundtrip(Request::ReplConf {
            key: "listening-port".into(),
            value: "6666".into(),
        });
        roundtrip(Request::Psync {
            next_seq: SequenceNumber::new(101),
        });
        roundtrip(Request::FetchMeta);
        roundtrip(Request::FetchFile {
            name: "000017.sst".into(),
        });
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            Request::parse("psync 7").unwrap(),
            Request::Psync {
                next_seq: SequenceNumber::new(7)
            }
        );
        assert_eq!(Request::parse("_DB_NAME").unwrap(), Request::DbName);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            Request::parse("FLUSHALL"),
            Err(WireError::UnknownCommand(_))
        ));
        assert!(Request::parse("PSYNC notanumber").is_err());
        assert!(Request::parse("AUTH").is_err());
        assert!(Request::parse("PSYNC 1 2").is_err());
    }

    #[test]
    fn decode_line_skips_probes() {
        let mut buf = BytesMut::from(&b"\n\r\nPSYNC 5\r\n"[..]);
        let line = decode_line(&mut buf).unwrap().unwrap();
        assert_eq!(line, "PSYNC 5");
    }

    #[test]
    fn decode_line_incomplete() {
        let mut buf = BytesMut::from(&b"PSYNC 1"[..]);
        assert!(decode_line(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"01\r\n");
        assert_eq!(decode_line(&mut buf).unwrap().unwrap(), "PSYNC 101");
    }

    #[test]
    fn decode_line_too_long() {
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_LENGTH + 1].as_slice());
        assert!(matches!(
            decode_line(&mut buf),
            Err(WireError::LineTooLong { .. })
        ));
    }
}
