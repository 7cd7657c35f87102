//! The slave-side host adapter.
//!
//! [`ServerHost`] implements [`ReplicaHost`] over a storage engine: it
//! applies replicated batches, gates I/O behind the loading flag during a
//! restore, swaps the engine onto a fetched backup (or rolls back), and
//! carries the fetch-thread gauge. The outer server wires pubsub fan-out
//! and propagated-command execution in through hooks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use cinder_repl::ReplicaHost;
use cinder_storage::{Engine, StorageError, StorageResult};
use cinder_types::SequenceNumber;
use tracing::{debug, error, info, warn};

/// Callback receiving `(channel, message)` or `(key, value)` pairs.
pub type UpdateHook = Box<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// A [`ReplicaHost`] backed by a storage engine.
pub struct ServerHost {
    engine: Arc<dyn Engine>,
    /// Where the replication client lands fetched backup files.
    backup_dir: PathBuf,
    /// True inside the restore window; storage-touching requests are
    /// rejected while set.
    loading: AtomicBool,
    fetch_threads: AtomicI64,
    pre_full_syncs: AtomicU64,
    full_syncs: AtomicU64,
    failed_full_syncs: AtomicU64,
    publish_hook: Option<UpdateHook>,
    propagate_hook: Option<UpdateHook>,
}

impl ServerHost {
    /// Creates a host over `engine`, restoring from `backup_dir`.
    pub fn new(engine: Arc<dyn Engine>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            backup_dir: backup_dir.into(),
            loading: AtomicBool::new(false),
            fetch_threads: AtomicI64::new(0),
            pre_full_syncs: AtomicU64::new(0),
            full_syncs: AtomicU64::new(0),
            failed_full_syncs: AtomicU64::new(0),
            publish_hook: None,
            propagate_hook: None,
        }
    }

    /// Wires pubsub fan-out in.
    pub fn with_publish_hook(mut self, hook: UpdateHook) -> Self {
        self.publish_hook = Some(hook);
        self
    }

    /// Wires propagated-command execution in.
    pub fn with_propagate_hook(mut self, hook: UpdateHook) -> Self {
        self.propagate_hook = Some(hook);
        self
    }

    /// True while a restore is swapping storage underneath the server.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Number of live fetch workers (the "fetch-file-threads" gauge).
    pub fn fetch_thread_count(&self) -> i64 {
        self.fetch_threads.load(Ordering::SeqCst)
    }

    /// Times the restore window was entered.
    pub fn pre_full_sync_count(&self) -> u64 {
        self.pre_full_syncs.load(Ordering::SeqCst)
    }

    /// Successful restores.
    pub fn full_sync_count(&self) -> u64 {
        self.full_syncs.load(Ordering::SeqCst)
    }

    /// Failed or rolled-back restores.
    pub fn failed_full_sync_count(&self) -> u64 {
        self.failed_full_syncs.load(Ordering::SeqCst)
    }

    /// The engine behind this host.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl ReplicaHost for ServerHost {
    fn apply_batch(&self, payload: &[u8]) -> StorageResult<SequenceNumber> {
        if self.is_loading() {
            return Err(StorageError::Closed);
        }
        self.engine.apply_batch(payload)
    }

    fn latest_sequence(&self) -> SequenceNumber {
        self.engine.latest_sequence()
    }

    fn publish(&self, channel: &[u8], message: &[u8]) {
        match &self.publish_hook {
            Some(hook) => hook(channel, message),
            None => debug!(
                channel = %String::from_utf8_lossy(channel),
                bytes = message.len(),
                "no pubsub hook, replicated publish dropped"
            ),
        }
    }

    fn execute_propagated(&self, key: &[u8], value: &[u8]) {
        match &self.propagate_hook {
            Some(hook) => hook(key, value),
            None => debug!(
                key = %String::from_utf8_lossy(key),
                bytes = value.len(),
                "no propagate hook, replicated command dropped"
            ),
        }
    }

    fn pre_full_sync(&self) {
        info!("entering restore: rejecting storage i/o, closing engine");
        self.loading.store(true, Ordering::SeqCst);
        self.pre_full_syncs.fetch_add(1, Ordering::SeqCst);
        self.engine.close();
    }

    fn post_full_sync(&self, succeeded: bool) {
        if succeeded {
            match self.engine.restore_from(&self.backup_dir) {
                Ok(()) => {
                    self.full_syncs.fetch_add(1, Ordering::SeqCst);
                    info!(
                        seq = %self.engine.latest_sequence(),
                        "restore complete, engine reopened on new backup"
                    );
                }
                Err(e) => {
                    error!(error = %e, "restore failed, rolling back to previous state");
                    self.failed_full_syncs.fetch_add(1, Ordering::SeqCst);
                    self.engine.reopen();
                }
            }
        } else {
            warn!("full sync aborted, rolling back to previous state");
            self.failed_full_syncs.fetch_add(1, Ordering::SeqCst);
            self.engine.reopen();
        }
        self.loading.store(false, Ordering::SeqCst);
    }

    fn fetch_thread_started(&self) {
        self.fetch_threads.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch_thread_finished(&self) {
        self.fetch_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_storage::{MemoryEngine, WriteBatch};
    use cinder_types::ColumnFamily;

    fn host_with_engine() -> (Arc<ServerHost>, MemoryEngine, tempfile::TempDir) {
        let backup = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let host = Arc::new(ServerHost::new(
            Arc::new(engine.clone()),
            backup.path(),
        ));
        (host, engine, backup)
    }

    #[test]
    fn loading_flag_gates_applies() {
        let (host, engine, _backup) = host_with_engine();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Default, &b"k"[..], &b"v"[..]);
        let seq = engine.write(batch).unwrap();
        assert_eq!(seq, SequenceNumber::new(1));

        host.pre_full_sync();
        assert!(host.is_loading());
        assert!(matches!(
            host.apply_batch(b"anything"),
            Err(StorageError::Closed)
        ));

        host.post_full_sync(false);
        assert!(!host.is_loading());
        assert_eq!(host.failed_full_sync_count(), 1);
        // Rolled back: previous state intact.
        assert_eq!(engine.get(ColumnFamily::Default, b"k").unwrap().as_ref(), b"v");
    }

    #[test]
    fn successful_restore_swaps_engine() {
        let (host, engine, backup) = host_with_engine();

        // Stage a backup from a donor engine at sequence 2.
        let donor = MemoryEngine::new();
        for key in ["a", "b"] {
            let mut batch = WriteBatch::new();
            batch.put(ColumnFamily::Default, key.as_bytes().to_vec(), &b"x"[..]);
            donor.write(batch).unwrap();
        }
        donor.create_backup(backup.path()).unwrap();

        host.pre_full_sync();
        host.post_full_sync(true);

        assert_eq!(host.pre_full_sync_count(), 1);
        assert_eq!(host.full_sync_count(), 1);
        assert_eq!(engine.latest_sequence(), SequenceNumber::new(2));
        assert!(engine.get(ColumnFamily::Default, b"a").is_some());
    }

    #[test]
    fn gauge_tracks_workers() {
        let (host, _engine, _backup) = host_with_engine();
        host.fetch_thread_started();
        host.fetch_thread_started();
        assert_eq!(host.fetch_thread_count(), 2);
        host.fetch_thread_finished();
        host.fetch_thread_finished();
        assert_eq!(host.fetch_thread_count(), 0);
    }

    #[test]
    fn hooks_receive_updates() {
        use std::sync::Mutex;

        let backup = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let host = ServerHost::new(Arc::new(engine), backup.path()).with_publish_hook(Box::new(
            move |channel, message| {
                sink.lock().unwrap().push(format!(
                    "{}={}",
                    String::from_utf8_lossy(channel),
                    String::from_utf8_lossy(message)
                ));
            },
        ));

        host.publish(b"news", b"hello");
        assert_eq!(&*seen.lock().unwrap(), &["news=hello"]);
    }
}
