//! The master replication service: feeder registry, backup staging, and
//! PSYNC admission.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use cinder_repl::Feeder;
use cinder_storage::{BackupMeta, Engine, StorageResult};
use cinder_types::SequenceNumber;
use tracing::{debug, info};

use crate::config::MasterConfig;
use crate::error::{ServerError, ServerResult};

/// Shared state of the master replication endpoint.
///
/// The feeder list is the one piece of state handler threads contend on;
/// it is guarded by a mutex, with exited feeders reaped whenever a new
/// slave attaches (and on demand).
pub struct MasterService {
    engine: Arc<dyn Engine>,
    config: MasterConfig,
    feeders: Mutex<Vec<Feeder>>,
}

impl MasterService {
    /// Creates the service over an engine.
    pub fn new(engine: Arc<dyn Engine>, config: MasterConfig) -> Self {
        Self {
            engine,
            config,
            feeders: Mutex::new(Vec::new()),
        }
    }

    /// The engine this master serves.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The endpoint configuration.
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Whether a PSYNC at `seq` can be served from the retained WAL.
    ///
    /// Accepts `first_wal <= seq <= latest + 1`; the upper bound is a
    /// caught-up slave. Everything else must full-sync.
    pub fn psync_in_range(&self, seq: SequenceNumber) -> bool {
        if seq.is_zero() {
            return false; // sequences start at 1
        }
        seq >= self.engine.first_wal_sequence() && seq <= self.engine.latest_sequence().next()
    }

    /// Attaches a feeder streaming to `stream` from `next_repl_seq`.
    pub fn add_slave(&self, stream: TcpStream, next_repl_seq: SequenceNumber) -> ServerResult<()> {
        self.cleanup_exited_feeders();
        let feeder = Feeder::spawn(
            stream,
            Arc::clone(&self.engine),
            next_repl_seq,
            self.config.feeder.clone(),
        )?;
        let mut feeders = self.lock_feeders();
        feeders.push(feeder);
        info!(slaves = feeders.len(), seq = %next_repl_seq, "slave attached");
        Ok(())
    }

    /// Reaps feeders whose threads have exited.
    pub fn cleanup_exited_feeders(&self) {
        let mut feeders = self.lock_feeders();
        feeders.retain_mut(|feeder| {
            if feeder.is_exited() {
                debug!(peer = %feeder.peer(), "reaping exited feeder");
                feeder.join();
                false
            } else {
                true
            }
        });
    }

    /// Stops and joins every feeder (e.g. on shutdown or demotion).
    pub fn disconnect_slaves(&self) {
        let mut feeders = self.lock_feeders();
        for feeder in feeders.iter() {
            feeder.stop();
        }
        let count = feeders.len();
        feeders.clear(); // drop joins each feeder
        if count > 0 {
            info!(count, "disconnected slaves");
        }
    }

    /// Number of currently attached slaves.
    pub fn slave_count(&self) -> usize {
        self.lock_feeders().len()
    }

    /// Stages a fresh backup and returns its meta list.
    pub fn prepare_backup(&self) -> StorageResult<BackupMeta> {
        self.engine.create_backup(&self.config.backup_staging_dir)
    }

    /// Reads one staged backup file for `_fetch_file`.
    pub fn read_backup_file(&self, name: &str) -> ServerResult<Vec<u8>> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(ServerError::SuspiciousFileName(name.to_string()));
        }
        Ok(std::fs::read(self.config.backup_staging_dir.join(name))?)
    }

    /// `INFO`-style replication summary for host introspection.
    pub fn replication_info(&self) -> String {
        let feeders = self.lock_feeders();
        let mut info = String::new();
        info.push_str("role:master\n");
        info.push_str(&format!("connected_slaves:{}\n", feeders.len()));
        info.push_str(&format!(
            "latest_sequence:{}\n",
            self.engine.latest_sequence().as_u64()
        ));
        for (i, feeder) in feeders.iter().enumerate() {
            info.push_str(&format!(
                "slave{}:addr={},seq={}\n",
                i,
                feeder.peer(),
                feeder.current_repl_seq().as_u64()
            ));
        }
        info
    }

    fn lock_feeders(&self) -> std::sync::MutexGuard<'_, Vec<Feeder>> {
        self.feeders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::{MemoryEngine, WriteBatch};
    use cinder_types::ColumnFamily;

    fn service_with_batches(n: usize) -> (MasterService, MemoryEngine, tempfile::TempDir) {
        let staging = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        for i in 0..n {
            let mut batch = WriteBatch::new();
            batch.put(
                ColumnFamily::Default,
                format!("k{i}").into_bytes(),
                format!("v{i}").into_bytes(),
            );
            engine.write(batch).unwrap();
        }
        let service = MasterService::new(
            Arc::new(engine.clone()),
            MasterConfig::new(staging.path()),
        );
        (service, engine, staging)
    }

    #[test]
    fn psync_admission_window() {
        let (service, engine, _staging) = service_with_batches(5);

        assert!(!service.psync_in_range(SequenceNumber::ZERO));
        assert!(service.psync_in_range(SequenceNumber::new(1)));
        assert!(service.psync_in_range(SequenceNumber::new(5)));
        // A caught-up slave asks for latest + 1.
        assert!(service.psync_in_range(SequenceNumber::new(6)));
        assert!(!service.psync_in_range(SequenceNumber::new(7)));

        engine.purge_wal_to(SequenceNumber::new(3));
        assert!(!service.psync_in_range(SequenceNumber::new(2)));
        assert!(service.psync_in_range(SequenceNumber::new(3)));
    }

    #[test]
    fn backup_staging_and_file_reads() {
        let (service, _engine, staging) = service_with_batches(2);

        let meta = service.prepare_backup().unwrap();
        assert!(!meta.files.is_empty());

        for entry in &meta.files {
            let bytes = service.read_backup_file(&entry.name).unwrap();
            assert_eq!(crc32fast::hash(&bytes), entry.crc32);
            assert!(staging.path().join(&entry.name).exists());
        }
    }

    #[test]
    fn suspicious_file_names_rejected() {
        let (service, _engine, _staging) = service_with_batches(1);
        for name in ["../../etc/passwd", "a/b", "a\\b", "..", ""] {
            assert!(matches!(
                service.read_backup_file(name),
                Err(ServerError::SuspiciousFileName(_))
            ));
        }
    }

    #[test]
    fn replication_info_lists_role() {
        let (service, _engine, _staging) = service_with_batches(1);
        let info = service.replication_info();
        assert!(info.contains("role:master"));
        assert!(info.contains("connected_slaves:0"));
        assert!(info.contains("latest_sequence:1"));
    }
}
