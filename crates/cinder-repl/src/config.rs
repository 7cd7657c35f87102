//! Replication configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one replication client (slave side).
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Master address, `host:port`.
    pub master_addr: String,
    /// Password sent in the AUTH step; `None` skips the step.
    pub masterauth: Option<String>,
    /// Expected `_db_name` reply; a mismatch is fatal.
    pub namespace: String,
    /// Destination directory for fetched backup files.
    pub backup_dir: PathBuf,
    /// Parallelism of the full-sync file fetcher.
    pub fetch_file_threads: usize,
    /// Whether the host answers reads while not `Connected`.
    pub serve_stale_data: bool,
    /// Port announced via `REPLCONF listening-port`; `0` falls back to the
    /// replication socket's local port.
    pub listening_port: u16,
    /// First reconnect delay.
    pub backoff_floor: Duration,
    /// Reconnect delay ceiling.
    pub backoff_ceiling: Duration,
    /// How long to wait for the TCP connection to establish.
    pub connect_timeout: Duration,
}

impl ReplicationConfig {
    /// Creates a configuration with defaults for everything but the master
    /// address and backup directory.
    pub fn new(master_addr: impl Into<String>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            master_addr: master_addr.into(),
            masterauth: None,
            namespace: "default".to_string(),
            backup_dir: backup_dir.into(),
            fetch_file_threads: 4,
            serve_stale_data: true,
            listening_port: 0,
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the AUTH password.
    pub fn with_masterauth(mut self, password: impl Into<String>) -> Self {
        self.masterauth = Some(password.into());
        self
    }

    /// Sets the expected logical database name.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the file-fetch parallelism (1 is the serial case).
    pub fn with_fetch_file_threads(mut self, threads: usize) -> Self {
        self.fetch_file_threads = threads.max(1);
        self
    }

    /// Sets whether reads are answered while catching up.
    pub fn with_serve_stale_data(mut self, serve: bool) -> Self {
        self.serve_stale_data = serve;
        self
    }

    /// Sets the port announced to the master.
    pub fn with_listening_port(mut self, port: u16) -> Self {
        self.listening_port = port;
        self
    }

    /// Sets the reconnect backoff window.
    pub fn with_backoff(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.backoff_floor = floor;
        self.backoff_ceiling = ceiling.max(floor);
        self
    }
}

/// Configuration for a master-side feeder.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// Flush once this many batches are buffered.
    pub max_delay_updates: usize,
    /// Flush once this many bytes are buffered.
    pub max_delay_bytes: usize,
    /// Idle sleep floor; the sleep grows toward the ceiling while the slave
    /// is caught up and resets on activity.
    pub idle_floor: Duration,
    /// Idle sleep ceiling.
    pub idle_ceiling: Duration,
    /// How often to probe the slave socket while idle.
    pub liveness_interval: Duration,
    /// Terminate the feeder if a write stays blocked this long.
    pub write_timeout: Duration,
    /// Advisory per-feeder write-rate ceiling in MiB/s; `0` disables.
    pub max_replication_mb: u64,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            max_delay_updates: 16,
            max_delay_bytes: 16 * 1024,
            idle_floor: Duration::from_millis(10),
            idle_ceiling: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(2),
            write_timeout: Duration::from_secs(10),
            max_replication_mb: 0,
        }
    }
}

impl FeederConfig {
    /// Sets the advisory write-rate ceiling.
    pub fn with_max_replication_mb(mut self, mb: u64) -> Self {
        self.max_replication_mb = mb;
        self
    }

    /// Sets the write-blocked threshold.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the liveness probe interval.
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults() {
        let config = ReplicationConfig::new("127.0.0.1:6666", "/tmp/backup");
        assert_eq!(config.fetch_file_threads, 4);
        assert!(config.serve_stale_data);
        assert!(config.masterauth.is_none());
        assert_eq!(config.backoff_floor, Duration::from_secs(1));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(10));
    }

    #[test]
    fn fetch_threads_never_zero() {
        let config =
            ReplicationConfig::new("127.0.0.1:6666", "/tmp/backup").with_fetch_file_threads(0);
        assert_eq!(config.fetch_file_threads, 1);
    }

    #[test]
    fn feeder_config_defaults_match_pacing_thresholds() {
        let config = FeederConfig::default();
        assert_eq!(config.max_delay_updates, 16);
        assert_eq!(config.max_delay_bytes, 16 * 1024);
        assert_eq!(config.max_replication_mb, 0);
    }
}
