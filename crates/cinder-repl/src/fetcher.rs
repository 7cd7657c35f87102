//! Parallel backup-file fetcher.
//!
//! Given the meta list from `_fetch_meta`, the fetcher partitions the files
//! round-robin over `threads` workers. Each worker opens its own blocking
//! connection to the master, authenticates, and pulls its shard file by
//! file: the payload streams into `<name>.tmp` while a CRC32 accumulates,
//! and the temp file is atomically renamed only when the CRC matches the
//! declared one.
//!
//! Cancellation is cooperative: a shared stop flag is inspected between
//! files, and the first failing shard flips an internal cancel flag so its
//! peers wind down instead of finishing a doomed transfer. Partial temp
//! files are always removed.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use cinder_storage::BackupFileEntry;
use cinder_wire::{decode_reply, parse_bulk_header, Reply, Request};
use tracing::{debug, info, warn};

use crate::error::{ReplError, ReplResult};

/// Per-socket read/write timeout during a transfer.
const FETCH_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Observes fetch progress; the host bridges this to its gauges.
pub trait FetchObserver: Send + Sync {
    /// One file landed (or was already present with a matching CRC).
    fn file_fetched(&self, name: &str, crc32: u32) {
        let _ = (name, crc32);
    }

    /// A worker thread came up.
    fn worker_started(&self) {}

    /// A worker thread finished.
    fn worker_finished(&self) {}
}

/// An observer that ignores everything.
pub struct NullObserver;

impl FetchObserver for NullObserver {}

/// What to fetch and where to put it.
pub struct FetchSpec<'a> {
    /// Master address, `host:port`.
    pub master_addr: &'a str,
    /// Password for the per-connection AUTH, if any.
    pub masterauth: Option<&'a str>,
    /// Destination directory.
    pub dest_dir: &'a Path,
    /// The meta list to fetch.
    pub files: &'a [BackupFileEntry],
    /// Worker count; 1 is the degenerate serial case.
    pub threads: usize,
}

/// Downloads every file in the meta list, in parallel shards.
///
/// Returns only when all shards succeeded, or with the first error observed
/// after the remaining workers wound down. `stop` cancels between files
/// with [`ReplError::Stopped`].
pub fn fetch_files(
    spec: &FetchSpec<'_>,
    stop: &AtomicBool,
    observer: &dyn FetchObserver,
) -> ReplResult<()> {
    if spec.files.is_empty() {
        debug!("meta list is empty, nothing to fetch");
        return Ok(());
    }

    for entry in spec.files {
        validate_file_name(&entry.name)?;
    }
    fs::create_dir_all(spec.dest_dir)?;

    let threads = spec.threads.clamp(1, spec.files.len());
    let mut shards: Vec<Vec<&BackupFileEntry>> = vec![Vec::new(); threads];
    for (i, entry) in spec.files.iter().enumerate() {
        shards[i % threads].push(entry);
    }

    info!(
        files = spec.files.len(),
        workers = threads,
        dir = %spec.dest_dir.display(),
        "fetching backup files"
    );

    let cancel = AtomicBool::new(false);
    let halted = || stop.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst);

    let results: Vec<ReplResult<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .into_iter()
            .map(|shard| {
                let cancel = &cancel;
                let halted = &halted;
                scope.spawn(move || {
                    observer.worker_started();
                    let result = fetch_shard(spec, &shard, halted, observer);
                    if result.is_err() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    observer.worker_finished();
                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(ReplError::Fatal("fetch worker panicked".into())))
            })
            .collect()
    });

    // Prefer the underlying failure over a cooperative-cancel "stopped".
    let mut stopped = false;
    for result in results {
        match result {
            Ok(()) => {}
            Err(ReplError::Stopped) => stopped = true,
            Err(e) => return Err(e),
        }
    }
    if stopped {
        return Err(ReplError::Stopped);
    }
    Ok(())
}

fn validate_file_name(name: &str) -> ReplResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(ReplError::Protocol(format!(
            "refusing suspicious backup file name '{name}'"
        )));
    }
    Ok(())
}

fn fetch_shard(
    spec: &FetchSpec<'_>,
    shard: &[&BackupFileEntry],
    halted: &dyn Fn() -> bool,
    observer: &dyn FetchObserver,
) -> ReplResult<()> {
    let mut conn = FetchConn::connect(spec.master_addr, spec.masterauth)?;

    for entry in shard {
        if halted() {
            return Err(ReplError::Stopped);
        }

        // Resumable full sync: a file that already matches is not re-fetched.
        let dest = spec.dest_dir.join(&entry.name);
        if let Ok(existing) = fs::read(&dest) {
            if crc32fast::hash(&existing) == entry.crc32 {
                debug!(file = %entry.name, "destination already matches, skipping");
                observer.file_fetched(&entry.name, entry.crc32);
                continue;
            }
        }

        conn.fetch_one(entry, spec.dest_dir)?;
        observer.file_fetched(&entry.name, entry.crc32);
    }
    Ok(())
}

// ============================================================================
// Per-worker connection
// ============================================================================

struct FetchConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl FetchConn {
    fn connect(addr: &str, auth: Option<&str>) -> ReplResult<Self> {
        let stream = TcpStream::connect(addr).map_err(|source| ReplError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_read_timeout(Some(FETCH_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(FETCH_IO_TIMEOUT))?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        };

        if let Some(password) = auth {
            conn.send(&Request::Auth {
                password: password.to_string(),
            })?;
            let reply = conn.read_reply()?;
            if !reply.is_ok() {
                return Err(ReplError::Auth(
                    reply
                        .as_error()
                        .unwrap_or("unexpected AUTH reply")
                        .to_string(),
                ));
            }
        }
        Ok(conn)
    }

    fn send(&mut self, request: &Request) -> ReplResult<()> {
        let mut out = BytesMut::new();
        request.encode(&mut out);
        self.stream.write_all(&out)?;
        Ok(())
    }

    fn read_more(&mut self) -> ReplResult<()> {
        let mut chunk = [0u8; 8 * 1024];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "master closed during fetch",
            )
            .into());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn read_reply(&mut self) -> ReplResult<Reply> {
        loop {
            if let Some(reply) = decode_reply(&mut self.buf)? {
                return Ok(reply);
            }
            self.read_more()?;
        }
    }

    /// Reads the bulk header of a file payload, surfacing a master-side
    /// error reply (e.g. the file vanished between meta and fetch).
    fn read_payload_len(&mut self) -> ReplResult<u64> {
        loop {
            if self.buf.first() == Some(&b'-') {
                let reply = self.read_reply()?;
                return Err(ReplError::Protocol(format!(
                    "fetch refused: {}",
                    reply.as_error().unwrap_or("unknown error")
                )));
            }
            match parse_bulk_header(&mut self.buf)? {
                Some(len) => return Ok(len),
                None => self.read_more()?,
            }
        }
    }

    fn fetch_one(&mut self, entry: &BackupFileEntry, dir: &Path) -> ReplResult<()> {
        self.send(&Request::FetchFile {
            name: entry.name.clone(),
        })?;
        let len = self.read_payload_len()?;

        let tmp_path = dir.join(format!("{}.tmp", entry.name));
        let streamed = self.stream_payload(len, &tmp_path);

        match streamed {
            Ok(actual) if actual == entry.crc32 => {
                fs::rename(&tmp_path, dir.join(&entry.name))?;
                debug!(
                    file = %entry.name,
                    bytes = len,
                    crc = format_args!("{:08x}", entry.crc32),
                    "backup file fetched"
                );
                Ok(())
            }
            Ok(actual) => {
                let _ = fs::remove_file(&tmp_path);
                warn!(
                    file = %entry.name,
                    expected = format_args!("{:08x}", entry.crc32),
                    actual = format_args!("{actual:08x}"),
                    "crc mismatch, discarding"
                );
                Err(ReplError::CrcMismatch {
                    name: entry.name.clone(),
                    expected: entry.crc32,
                    actual,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// Streams `len` payload bytes into `path`, returning the content CRC.
    fn stream_payload(&mut self, len: u64, path: &Path) -> ReplResult<u32> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = len;

        while remaining > 0 {
            if self.buf.is_empty() {
                self.read_more()?;
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            let chunk = self.buf.split_to(take);
            hasher.update(&chunk);
            writer.write_all(&chunk)?;
            remaining -= take as u64;
        }

        while self.buf.len() < 2 {
            self.read_more()?;
        }
        let crlf = self.buf.split_to(2);
        if &crlf[..] != b"\r\n" {
            return Err(ReplError::Protocol(
                "missing trailing CRLF after file payload".into(),
            ));
        }

        writer.flush()?;
        Ok(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_wire::decode_line;
    use std::collections::HashMap;
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// A minimal master speaking only AUTH and `_fetch_file`.
    fn spawn_file_server(
        files: HashMap<String, Vec<u8>>,
        requirepass: Option<String>,
        connections: usize,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let files = Arc::new(files);

        std::thread::spawn(move || {
            for _ in 0..connections {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let files = Arc::clone(&files);
                let requirepass = requirepass.clone();
                std::thread::spawn(move || serve_connection(stream, &files, requirepass));
            }
        });
        addr
    }

    fn serve_connection(
        mut stream: TcpStream,
        files: &HashMap<String, Vec<u8>>,
        requirepass: Option<String>,
    ) {
        let mut buf = BytesMut::new();
        let mut authed = requirepass.is_none();
        let mut chunk = [0u8; 4096];

        loop {
            let line = loop {
                match decode_line(&mut buf) {
                    Ok(Some(line)) => break line,
                    Ok(None) => match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    },
                    Err(_) => return,
                }
            };

            let mut out = BytesMut::new();
            match Request::parse(&line) {
                Ok(Request::Auth { password }) => {
                    if Some(&password) == requirepass.as_ref() {
                        authed = true;
                        Reply::ok().encode(&mut out);
                    } else {
                        Reply::Error("ERR invalid password".into()).encode(&mut out);
                    }
                }
                Ok(Request::FetchFile { name }) if authed => match files.get(&name) {
                    Some(content) => {
                        Reply::Bulk(bytes::Bytes::from(content.clone())).encode(&mut out)
                    }
                    None => Reply::err("no such file").encode(&mut out),
                },
                Ok(_) if !authed => {
                    Reply::Error("NOAUTH Authentication required.".into()).encode(&mut out)
                }
                _ => Reply::err("unexpected command").encode(&mut out),
            }
            if stream.write_all(&out).is_err() {
                return;
            }
        }
    }

    fn entry(name: &str, content: &[u8]) -> BackupFileEntry {
        BackupFileEntry {
            name: name.to_string(),
            crc32: crc32fast::hash(content),
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        fetched: AtomicUsize,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl FetchObserver for CountingObserver {
        fn file_fetched(&self, _name: &str, _crc32: u32) {
            self.fetched.fetch_add(1, Ordering::SeqCst);
        }
        fn worker_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn worker_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn parallel_fetch_lands_all_files() {
        let contents: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| (format!("file{i}"), format!("content-{i}").repeat(100).into_bytes()))
            .collect();
        let files: Vec<BackupFileEntry> =
            contents.iter().map(|(n, c)| entry(n, c)).collect();
        let addr = spawn_file_server(contents.iter().cloned().collect(), None, 2);

        let dir = tempfile::tempdir().unwrap();
        let observer = CountingObserver::default();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: None,
            dest_dir: dir.path(),
            files: &files,
            threads: 2,
        };

        fetch_files(&spec, &AtomicBool::new(false), &observer).unwrap();

        for (name, content) in &contents {
            assert_eq!(&fs::read(dir.path().join(name)).unwrap(), content);
            assert!(!dir.path().join(format!("{name}.tmp")).exists());
        }
        assert_eq!(observer.fetched.load(Ordering::SeqCst), 5);
        assert_eq!(observer.started.load(Ordering::SeqCst), 2);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn serial_fetch_works() {
        let content = b"serial".to_vec();
        let files = vec![entry("only", &content)];
        let addr = spawn_file_server(
            [("only".to_string(), content.clone())].into(),
            None,
            1,
        );

        let dir = tempfile::tempdir().unwrap();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: None,
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };
        fetch_files(&spec, &AtomicBool::new(false), &NullObserver).unwrap();
        assert_eq!(fs::read(dir.path().join("only")).unwrap(), content);
    }

    #[test]
    fn crc_mismatch_fails_and_removes_temp() {
        let good = b"good content".to_vec();
        let bad = b"tampered content".to_vec();
        let files = vec![
            entry("a", &good),
            BackupFileEntry {
                name: "b".into(),
                crc32: 0x0bad_0bad, // will not match what the master serves
            },
        ];
        let served: HashMap<String, Vec<u8>> =
            [("a".to_string(), good.clone()), ("b".to_string(), bad)].into();
        let addr = spawn_file_server(served, None, 1);

        let dir = tempfile::tempdir().unwrap();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: None,
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };

        let err = fetch_files(&spec, &AtomicBool::new(false), &NullObserver).unwrap_err();
        assert!(matches!(err, ReplError::CrcMismatch { ref name, .. } if name == "b"));

        assert!(!dir.path().join("b").exists());
        assert!(!dir.path().join("b.tmp").exists());
        // The shard processed "a" before failing on "b".
        assert_eq!(fs::read(dir.path().join("a")).unwrap(), good);
    }

    #[test]
    fn matching_destination_is_skipped() {
        let content = b"cached".to_vec();
        let files = vec![entry("cached-file", &content)];
        // Master that serves nothing: a request would fail the test.
        let addr = spawn_file_server(HashMap::new(), None, 1);

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cached-file"), &content).unwrap();

        let observer = CountingObserver::default();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: None,
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };
        fetch_files(&spec, &AtomicBool::new(false), &observer).unwrap();
        assert_eq!(observer.fetched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auth_is_performed_per_connection() {
        let content = b"secret data".to_vec();
        let files = vec![entry("f", &content)];
        let addr = spawn_file_server(
            [("f".to_string(), content.clone())].into(),
            Some("hunter2".into()),
            1,
        );

        let dir = tempfile::tempdir().unwrap();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: Some("hunter2"),
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };
        fetch_files(&spec, &AtomicBool::new(false), &NullObserver).unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), content);
    }

    #[test]
    fn wrong_password_is_auth_error() {
        let addr = spawn_file_server(HashMap::new(), Some("right".into()), 1);
        let files = vec![entry("f", b"x")];

        let dir = tempfile::tempdir().unwrap();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: Some("wrong"),
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };
        let err = fetch_files(&spec, &AtomicBool::new(false), &NullObserver).unwrap_err();
        assert!(matches!(err, ReplError::Auth(_)));
    }

    #[test]
    fn stop_flag_cancels_between_files() {
        let files = vec![entry("f", b"x")];
        let addr = spawn_file_server(HashMap::new(), None, 1);

        let dir = tempfile::tempdir().unwrap();
        let spec = FetchSpec {
            master_addr: &addr.to_string(),
            masterauth: None,
            dest_dir: dir.path(),
            files: &files,
            threads: 1,
        };
        let stop = AtomicBool::new(true);
        let err = fetch_files(&spec, &stop, &NullObserver).unwrap_err();
        assert!(matches!(err, ReplError::Stopped));
    }

    #[test]
    fn suspicious_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../evil", "a/b", "a\\b", ""] {
            let files = vec![BackupFileEntry {
                name: name.to_string(),
                crc32: 0,
            }];
            let spec = FetchSpec {
                master_addr: "127.0.0.1:1",
                masterauth: None,
                dest_dir: dir.path(),
                files: &files,
                threads: 1,
            };
            assert!(
                fetch_files(&spec, &AtomicBool::new(false), &NullObserver).is_err(),
                "name '{name}' should be rejected"
            );
        }
    }

    #[test]
    fn empty_meta_is_a_noop() {
        let spec = FetchSpec {
            master_addr: "127.0.0.1:1", // never contacted
            masterauth: None,
            dest_dir: Path::new("/nonexistent/never-created"),
            files: &[],
            threads: 4,
        };
        fetch_files(&spec, &AtomicBool::new(false), &NullObserver).unwrap();
    }
}
