//! In-memory storage engine.
//!
//! `MemoryEngine` implements the [`Engine`] contract entirely in memory: a
//! `BTreeMap` per column family plus a retained list of WAL frames. It backs
//! the test suites and single-node development; a production deployment
//! plugs a persistent engine into the same trait.
//!
//! Backups are real files on disk (one dump per column family plus the
//! `MANIFEST`), so the full-sync path is exercised end to end.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes};
use cinder_types::{BackupId, ColumnFamily, SequenceNumber};
use tracing::{debug, info};

use crate::backup::{BackupFileEntry, BackupMeta, Manifest};
use crate::batch::{decode_batch, encode_batch, BatchOp, WriteBatch};
use crate::engine::{Engine, WalFrame, WalIterator};
use crate::error::{StorageError, StorageResult};

type CfMap = BTreeMap<Vec<u8>, Bytes>;

struct Inner {
    maps: [CfMap; 3],
    /// Retained WAL frames, ordered by sequence, contiguous.
    wal: Vec<WalFrame>,
    /// Sequence of the most recently applied update.
    latest: SequenceNumber,
    /// Oldest sequence still retained in the WAL.
    first_wal: SequenceNumber,
    last_backup_id: BackupId,
    closed: bool,
}

impl Inner {
    fn apply_ops(&mut self, ops: &[BatchOp]) {
        for op in ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    self.maps[cf_index(*cf)].insert(key.to_vec(), value.clone());
                }
                BatchOp::Delete { cf, key } => {
                    self.maps[cf_index(*cf)].remove(key.as_ref());
                }
            }
        }
    }
}

fn cf_index(cf: ColumnFamily) -> usize {
    cf.as_u8() as usize
}

/// An in-memory [`Engine`].
///
/// Cloning the handle shares the underlying state.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                maps: Default::default(),
                wal: Vec::new(),
                latest: SequenceNumber::ZERO,
                first_wal: SequenceNumber::new(1),
                last_backup_id: BackupId::ZERO,
                closed: false,
            })),
        }
    }

    /// Drops WAL frames wholly below `up_to`.
    ///
    /// Models the engine's background log trimming; a feeder whose slave sits
    /// below the trim point gets [`StorageError::SequencePurged`] on its next
    /// read.
    pub fn purge_wal_to(&self, up_to: SequenceNumber) {
        let mut inner = self.lock();
        let keep_from = inner
            .wal
            .partition_point(|frame| frame.next_sequence() <= up_to);
        inner.wal.drain(..keep_from);

        let new_first = match inner.wal.first() {
            Some(frame) => frame.first_sequence,
            None => inner.latest.next().min(up_to.max(inner.first_wal)),
        };
        if new_first > inner.first_wal {
            debug!(from = %inner.first_wal, to = %new_first, "purged wal");
            inner.first_wal = new_first;
        }
    }

    /// Number of retained WAL frames (test hook).
    pub fn wal_frame_count(&self) -> usize {
        self.lock().wal.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Engine for MemoryEngine {
    fn latest_sequence(&self) -> SequenceNumber {
        self.lock().latest
    }

    fn first_wal_sequence(&self) -> SequenceNumber {
        self.lock().first_wal
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<SequenceNumber> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if batch.is_empty() {
            return Err(StorageError::EmptyBatch);
        }

        let first = inner.latest.next();
        let count = batch.len() as u32;
        let payload = encode_batch(first, &batch);

        inner.apply_ops(batch.ops());
        inner.wal.push(WalFrame {
            first_sequence: first,
            update_count: count,
            payload,
        });
        inner.latest = first.advance(count - 1);
        Ok(inner.latest)
    }

    fn apply_batch(&self, payload: &[u8]) -> StorageResult<SequenceNumber> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let decoded = decode_batch(payload)?;
        let expected = inner.latest.next();
        if decoded.first_sequence != expected {
            return Err(StorageError::OutOfOrderBatch {
                expected,
                actual: decoded.first_sequence,
            });
        }

        inner.apply_ops(&decoded.ops);
        inner.wal.push(WalFrame {
            first_sequence: decoded.first_sequence,
            update_count: decoded.update_count(),
            payload: Bytes::copy_from_slice(payload),
        });
        inner.latest = decoded.last_sequence();
        Ok(inner.latest)
    }

    fn wal_since(&self, from: SequenceNumber) -> StorageResult<Box<dyn WalIterator>> {
        let inner = self.lock();
        if from < inner.first_wal {
            return Err(StorageError::SequencePurged {
                requested: from,
                oldest: inner.first_wal,
            });
        }
        if from > inner.latest.next() {
            return Err(StorageError::SequenceAhead {
                requested: from,
                latest: inner.latest,
            });
        }
        Ok(Box::new(MemoryWalIterator {
            inner: Arc::clone(&self.inner),
            cursor: from,
        }))
    }

    fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Bytes> {
        let inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.maps[cf_index(cf)].get(key).cloned()
    }

    fn create_backup(&self, dir: &Path) -> StorageResult<BackupMeta> {
        let mut inner = self.lock();
        std::fs::create_dir_all(dir)?;

        let id = inner.last_backup_id.next();
        inner.last_backup_id = id;

        let manifest = Manifest {
            id,
            sequence: inner.latest,
        };
        let manifest_text = manifest.to_text();
        std::fs::write(dir.join(crate::MANIFEST_FILE), &manifest_text)?;

        let mut files = vec![BackupFileEntry {
            name: crate::MANIFEST_FILE.to_string(),
            crc32: crc32fast::hash(manifest_text.as_bytes()),
        }];

        for cf in ColumnFamily::ALL {
            let dump = encode_cf_dump(&inner.maps[cf_index(cf)]);
            let name = cf_dump_name(cf);
            std::fs::write(dir.join(&name), &dump)?;
            files.push(BackupFileEntry {
                name,
                crc32: crc32fast::hash(&dump),
            });
        }

        info!(id = %id, sequence = %inner.latest, files = files.len(), "created backup");
        Ok(BackupMeta { id, files })
    }

    fn restore_from(&self, dir: &Path) -> StorageResult<()> {
        let mut inner = self.lock();
        debug_assert!(inner.closed, "restore requires a closed engine");

        // A backup with no manifest (the empty-meta case) restores to an
        // empty engine at sequence zero.
        let manifest = match Manifest::read_from(dir) {
            Ok(manifest) => Some(manifest),
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let mut maps: [CfMap; 3] = Default::default();
        for cf in ColumnFamily::ALL {
            match std::fs::read(dir.join(cf_dump_name(cf))) {
                Ok(dump) => maps[cf_index(cf)] = decode_cf_dump(&dump)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        inner.maps = maps;
        inner.latest = manifest.map(|m| m.sequence).unwrap_or(SequenceNumber::ZERO);
        inner.first_wal = inner.latest.next();
        inner.wal.clear();
        inner.closed = false;

        info!(
            id = ?manifest.map(|m| m.id),
            sequence = %inner.latest,
            "engine restored from backup"
        );
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        debug!("engine closed");
    }

    fn reopen(&self) {
        let mut inner = self.lock();
        inner.closed = false;
        debug!("engine reopened on previous state");
    }
}

struct MemoryWalIterator {
    inner: Arc<Mutex<Inner>>,
    cursor: SequenceNumber,
}

impl WalIterator for MemoryWalIterator {
    fn next_frame(&mut self) -> StorageResult<Option<WalFrame>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if self.cursor < inner.first_wal {
            return Err(StorageError::SequencePurged {
                requested: self.cursor,
                oldest: inner.first_wal,
            });
        }
        if self.cursor > inner.latest {
            return Ok(None); // caught up
        }

        let idx = inner
            .wal
            .partition_point(|frame| frame.next_sequence() <= self.cursor);
        let Some(frame) = inner.wal.get(idx) else {
            return Ok(None);
        };
        // Slaves only ever resume at batch boundaries.
        debug_assert_eq!(frame.first_sequence, self.cursor, "cursor inside a batch");

        self.cursor = frame.next_sequence();
        Ok(Some(frame.clone()))
    }
}

fn cf_dump_name(cf: ColumnFamily) -> String {
    format!("cf_{}.kv", cf.name())
}

/// Serializes one column family map: `[count:u32][klen,key,vlen,val]...`.
fn encode_cf_dump(map: &CfMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + map.len() * 32);
    buf.put_u32_le(map.len() as u32);
    for (key, value) in map {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }
    buf
}

fn decode_cf_dump(mut buf: &[u8]) -> StorageResult<CfMap> {
    if buf.remaining() < 4 {
        return Err(StorageError::Corrupt("cf dump header truncated".into()));
    }
    let count = buf.get_u32_le();
    let mut map = CfMap::new();
    for _ in 0..count {
        let key = take_dump_chunk(&mut buf)?;
        let value = take_dump_chunk(&mut buf)?;
        map.insert(key.to_vec(), Bytes::copy_from_slice(value));
    }
    if buf.has_remaining() {
        return Err(StorageError::Corrupt("trailing bytes in cf dump".into()));
    }
    Ok(map)
}

fn take_dump_chunk<'a>(buf: &mut &'a [u8]) -> StorageResult<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(StorageError::Corrupt("cf dump length truncated".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(StorageError::Corrupt("cf dump entry truncated".into()));
    }
    let chunk = &buf[..len];
    buf.advance(len);
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_one(engine: &MemoryEngine, key: &str, value: &str) -> SequenceNumber {
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, key.as_bytes().to_vec(), value.as_bytes().to_vec());
        engine.write(batch).expect("write")
    }

    #[test]
    fn write_assigns_dense_sequences() {
        let engine = MemoryEngine::new();
        assert_eq!(engine.latest_sequence(), SequenceNumber::ZERO);

        assert_eq!(put_one(&engine, "a", "1"), SequenceNumber::new(1));

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, &b"b"[..], &b"2"[..]);
        batch.put(ColumnFamily::Default, &b"c"[..], &b"3"[..]);
        assert_eq!(engine.write(batch).unwrap(), SequenceNumber::new(3));

        assert_eq!(engine.get(ColumnFamily::Default, b"c").unwrap().as_ref(), b"3");
    }

    #[test]
    fn empty_batch_rejected() {
        let engine = MemoryEngine::new();
        assert!(matches!(
            engine.write(WriteBatch::new()),
            Err(StorageError::EmptyBatch)
        ));
    }

    #[test]
    fn replicated_batches_apply_byte_identically() {
        let master = MemoryEngine::new();
        let slave = MemoryEngine::new();

        put_one(&master, "k1", "v1");
        put_one(&master, "k2", "v2");

        let mut iter = master.wal_since(SequenceNumber::new(1)).unwrap();
        while let Some(frame) = iter.next_frame().unwrap() {
            let applied = slave.apply_batch(&frame.payload).unwrap();
            assert_eq!(applied, frame.last_sequence());
        }

        assert_eq!(slave.latest_sequence(), master.latest_sequence());
        assert_eq!(slave.get(ColumnFamily::Default, b"k1").unwrap().as_ref(), b"v1");
        assert_eq!(slave.get(ColumnFamily::Default, b"k2").unwrap().as_ref(), b"v2");
    }

    #[test]
    fn out_of_order_batch_rejected() {
        let master = MemoryEngine::new();
        let slave = MemoryEngine::new();
        put_one(&master, "k1", "v1");
        put_one(&master, "k2", "v2");

        let mut iter = master.wal_since(SequenceNumber::new(2)).unwrap();
        let frame = iter.next_frame().unwrap().unwrap();
        assert!(matches!(
            slave.apply_batch(&frame.payload),
            Err(StorageError::OutOfOrderBatch { .. })
        ));
        assert_eq!(slave.latest_sequence(), SequenceNumber::ZERO);
    }

    #[test]
    fn iterator_tails_the_log() {
        let engine = MemoryEngine::new();
        put_one(&engine, "a", "1");

        let mut iter = engine.wal_since(SequenceNumber::new(1)).unwrap();
        assert!(iter.next_frame().unwrap().is_some());
        assert!(iter.next_frame().unwrap().is_none()); // caught up

        put_one(&engine, "b", "2");
        let frame = iter.next_frame().unwrap().unwrap();
        assert_eq!(frame.first_sequence, SequenceNumber::new(2));
    }

    #[test]
    fn caught_up_cursor_is_valid() {
        let engine = MemoryEngine::new();
        put_one(&engine, "a", "1");
        let mut iter = engine.wal_since(SequenceNumber::new(2)).unwrap();
        assert!(iter.next_frame().unwrap().is_none());
    }

    #[test]
    fn purge_invalidates_old_cursors() {
        let engine = MemoryEngine::new();
        for i in 0..5 {
            put_one(&engine, &format!("k{i}"), "v");
        }

        engine.purge_wal_to(SequenceNumber::new(4));
        assert_eq!(engine.first_wal_sequence(), SequenceNumber::new(4));
        assert_eq!(engine.wal_frame_count(), 2);

        assert!(matches!(
            engine.wal_since(SequenceNumber::new(2)),
            Err(StorageError::SequencePurged { .. })
        ));

        // A cursor opened before the purge fails on its next read.
        let mut iter = engine.wal_since(SequenceNumber::new(4)).unwrap();
        engine.purge_wal_to(SequenceNumber::new(6));
        assert!(matches!(
            iter.next_frame(),
            Err(StorageError::SequencePurged { .. })
        ));
    }

    #[test]
    fn wal_since_future_sequence_rejected() {
        let engine = MemoryEngine::new();
        put_one(&engine, "a", "1");
        assert!(matches!(
            engine.wal_since(SequenceNumber::new(5)),
            Err(StorageError::SequenceAhead { .. })
        ));
    }

    #[test]
    fn backup_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        put_one(&engine, "k1", "v1");
        put_one(&engine, "k2", "v2");

        let meta = engine.create_backup(dir.path()).unwrap();
        assert_eq!(meta.id, BackupId::new(1));
        // MANIFEST plus one dump per family.
        assert_eq!(meta.files.len(), 4);

        // Declared CRCs match the bytes on disk.
        for entry in &meta.files {
            let bytes = std::fs::read(dir.path().join(&entry.name)).unwrap();
            assert_eq!(crc32fast::hash(&bytes), entry.crc32, "crc of {}", entry.name);
        }

        let restored = MemoryEngine::new();
        restored.close();
        restored.restore_from(dir.path()).unwrap();

        assert_eq!(restored.latest_sequence(), engine.latest_sequence());
        assert_eq!(
            restored.get(ColumnFamily::Default, b"k1").unwrap().as_ref(),
            b"v1"
        );
        // The restored engine resumes sequencing after the snapshot.
        assert_eq!(
            restored.first_wal_sequence(),
            engine.latest_sequence().next()
        );
    }

    #[test]
    fn backup_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        put_one(&engine, "a", "1");

        let first = engine.create_backup(dir.path()).unwrap();
        let second = engine.create_backup(dir.path()).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn closed_engine_rejects_access() {
        let engine = MemoryEngine::new();
        put_one(&engine, "a", "1");
        engine.close();

        assert!(matches!(
            engine.write(WriteBatch::new()),
            Err(StorageError::Closed) | Err(StorageError::EmptyBatch)
        ));
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, &b"b"[..], &b"2"[..]);
        assert!(matches!(engine.write(batch), Err(StorageError::Closed)));
        assert!(engine.get(ColumnFamily::Default, b"a").is_none());
    }

    #[test]
    fn restore_without_manifest_yields_empty_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        engine.close();
        engine.restore_from(dir.path()).unwrap();
        assert_eq!(engine.latest_sequence(), SequenceNumber::ZERO);
        assert!(engine.get(ColumnFamily::Default, b"a").is_none());
    }
}
