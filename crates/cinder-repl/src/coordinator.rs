//! The restore bracket around a full sync.
//!
//! Swapping in a freshly downloaded backup is destructive: the host must
//! quiesce readers and close its storage handle before files land, and
//! reopen (or roll back) afterwards. The coordinator guarantees the two
//! host callbacks are invoked as a matched pair on every full-sync attempt,
//! including the ones that fail partway through the download.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::ReplicaHost;

/// Brackets the destructive restore window with the host's callbacks.
pub struct RestoreCoordinator {
    host: Arc<dyn ReplicaHost>,
}

impl RestoreCoordinator {
    /// Creates a coordinator over the host's callbacks.
    pub fn new(host: Arc<dyn ReplicaHost>) -> Self {
        Self { host }
    }

    /// Invokes the pre-full-sync callback and opens the restore window.
    ///
    /// The returned guard MUST outlive the file transfer. Dropping it
    /// without [`RestoreGuard::complete`] reports the restore as failed so
    /// the host can roll back to its previous state.
    pub fn begin(&self) -> RestoreGuard {
        debug!("entering restore window");
        self.host.pre_full_sync();
        RestoreGuard {
            host: Arc::clone(&self.host),
            completed: false,
        }
    }
}

/// The open restore window. Exactly one post-callback fires per guard.
pub struct RestoreGuard {
    host: Arc<dyn ReplicaHost>,
    completed: bool,
}

impl RestoreGuard {
    /// Closes the window successfully: the host reopens storage on the new
    /// backup.
    pub fn complete(mut self) {
        self.completed = true;
        debug!("restore window closed, backup swapped in");
        self.host.post_full_sync(true);
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!("restore window aborted, rolling back");
            self.host.post_full_sync(false);
        }
    }
}
