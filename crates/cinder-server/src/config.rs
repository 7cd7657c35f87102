//! Master-side replication configuration.

use std::path::PathBuf;

use cinder_repl::FeederConfig;

/// Configuration of the master replication endpoint.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Password slaves must present; `None` disables authentication.
    pub requirepass: Option<String>,
    /// Logical database name answered to `_db_name`.
    pub namespace: String,
    /// Directory backups are staged in for `_fetch_meta` / `_fetch_file`.
    pub backup_staging_dir: PathBuf,
    /// Pacing and liveness settings applied to every feeder.
    pub feeder: FeederConfig,
}

impl MasterConfig {
    /// Creates a configuration with defaults around the staging directory.
    pub fn new(backup_staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            requirepass: None,
            namespace: "default".to_string(),
            backup_staging_dir: backup_staging_dir.into(),
            feeder: FeederConfig::default(),
        }
    }

    /// Requires slaves to authenticate.
    pub fn with_requirepass(mut self, password: impl Into<String>) -> Self {
        self.requirepass = Some(password.into());
        self
    }

    /// Sets the logical database name.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets feeder pacing/liveness settings.
    pub fn with_feeder(mut self, feeder: FeederConfig) -> Self {
        self.feeder = feeder;
        self
    }
}
