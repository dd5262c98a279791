//! Change store port (driven/secondary port)
//!
//! This module defines the interface for persisting the last synchronized
//! state of a folder pair. One store instance is scoped to one folder pair;
//! all paths are relative to that pair's roots.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - A record exists exactly while the item is believed synchronized.
//! - Retry counters are independent of records: an item that was never
//!   synced can still accumulate failures.
//! - Subtree operations (`remove_tree`, `move_item`, `list_tree`) match by
//!   path component, so `a/b` never matches `a/bc`.

use chrono::{DateTime, Utc};

use crate::domain::newtypes::{ChangeToken, RelativePath, RemoteId};
use crate::domain::record::{ChangeRecord, OperationKind};
use crate::domain::sync_item::SyncItem;

/// Port trait for the persisted change-tracking store of one folder pair
#[async_trait::async_trait]
pub trait IChangeStore: Send + Sync {
    // --- Records ---

    /// Record keyed by local relative path
    async fn lookup(&self, local: &RelativePath) -> anyhow::Result<Option<ChangeRecord>>;

    /// Record whose remote relative path is `remote`
    async fn lookup_by_remote_path(
        &self,
        remote: &RelativePath,
    ) -> anyhow::Result<Option<ChangeRecord>>;

    /// Record for a remote object id
    async fn lookup_by_remote_id(&self, id: &RemoteId) -> anyhow::Result<Option<ChangeRecord>>;

    /// Inserts or replaces the record keyed by `record.local_path`
    async fn upsert(&self, record: &ChangeRecord) -> anyhow::Result<()>;

    /// Removes the record for one path (no-op when absent)
    async fn remove(&self, local: &RelativePath) -> anyhow::Result<()>;

    /// Removes the record for `local` and every record below it
    async fn remove_tree(&self, local: &RelativePath) -> anyhow::Result<()>;

    /// Rekeys `from` and its subtree to `to`, preserving every other field
    ///
    /// Both the local and the remote relative paths are rebased. Records
    /// already present under the target prefix are replaced.
    async fn move_item(&self, from: &SyncItem, to: &SyncItem) -> anyhow::Result<()>;

    /// Records for `prefix` and everything below it, ordered by local path
    async fn list_tree(&self, prefix: &RelativePath) -> anyhow::Result<Vec<ChangeRecord>>;

    // --- Retry counters ---

    async fn retry_count(&self, local: &RelativePath, kind: OperationKind) -> anyhow::Result<u32>;

    /// Increments a counter and returns its new value
    async fn increment_retry(&self, local: &RelativePath, kind: OperationKind)
        -> anyhow::Result<u32>;

    async fn reset_retry(&self, local: &RelativePath, kind: OperationKind) -> anyhow::Result<()>;

    // --- Folder state ---

    async fn change_log_token(&self) -> anyhow::Result<Option<ChangeToken>>;

    async fn set_change_log_token(&self, token: &ChangeToken) -> anyhow::Result<()>;

    /// When the last fully successful pass finished; `None` until first sync completes
    async fn last_full_sync(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn mark_full_sync(&self, at: DateTime<Utc>) -> anyhow::Result<()>;
}
