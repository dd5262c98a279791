//! Shared per-pass context
//!
//! One [`SyncContext`] is built for each pass, once a remote session is
//! available. Every engine of the pass holds the same `Arc<SyncContext>`.

use std::sync::Arc;

use docsync_core::config::RepoInfo;
use docsync_core::domain::{FolderRoots, OperationKind, RemoteCapabilities};
use docsync_core::ports::{IChangeStore, INotificationService, IRemoteRepository};

use crate::control::SyncControl;
use crate::filter::SyncFilter;
use crate::retry::RetryPolicy;

/// Everything an engine needs to act on one folder pair
pub struct SyncContext {
    pub repo: Arc<RepoInfo>,
    pub roots: Arc<FolderRoots>,
    pub remote: Arc<dyn IRemoteRepository>,
    pub capabilities: RemoteCapabilities,
    pub store: Arc<dyn IChangeStore>,
    pub notifier: Arc<dyn INotificationService>,
    pub control: Arc<SyncControl>,
    pub filter: Arc<SyncFilter>,
    pub retry: RetryPolicy,
}

impl SyncContext {
    pub fn is_bidirectional(&self) -> bool {
        self.repo.is_bidirectional()
    }

    /// Retry ceiling for one operation kind
    pub fn max_retries(&self, kind: OperationKind) -> u32 {
        match kind {
            OperationKind::Download => self.repo.max_download_retries,
            OperationKind::Upload => self.repo.max_upload_retries,
            OperationKind::Delete => self.repo.max_delete_retries,
        }
    }

    /// Key used to detect duplicate child names
    pub fn name_key(&self, name: &str) -> String {
        if self.repo.ignore_case_duplicates {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("folder", &self.repo.name)
            .field("roots", &self.roots)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
