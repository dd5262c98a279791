//! Change-store records
//!
//! A [`ChangeRecord`] exists exactly while the engine believes the item is
//! synchronized. Its absence means the item was either never synced or has
//! been removed; callers decide which from local and remote existence.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{Checksum, RelativePath, RemoteId};
use super::sync_item::SyncItem;

/// Last synchronized state of one file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub local_path: RelativePath,
    pub remote_path: RelativePath,
    pub remote_id: RemoteId,
    pub is_folder: bool,
    /// Server-side modification time at the last successful sync
    pub server_modified: Option<DateTime<Utc>>,
    /// Content checksum at the last successful sync (files only)
    pub checksum: Option<Checksum>,
    /// Free-form metadata snapshot
    pub metadata: BTreeMap<String, String>,
}

impl ChangeRecord {
    /// True when the server reports a modification after the recorded one
    ///
    /// A record without a timestamp is treated as stale.
    pub fn is_remote_newer(&self, remote_modified: DateTime<Utc>) -> bool {
        match self.server_modified {
            Some(recorded) => remote_modified > recorded,
            None => true,
        }
    }

    /// True when `live` differs from the recorded checksum
    pub fn is_dirty(&self, live: &Checksum) -> bool {
        self.checksum.as_ref() != Some(live)
    }
}

/// Values written to the store after a successful operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub remote_id: RemoteId,
    pub server_modified: Option<DateTime<Utc>>,
    pub checksum: Option<Checksum>,
    pub metadata: BTreeMap<String, String>,
}

impl RecordUpdate {
    pub fn new(remote_id: RemoteId, server_modified: DateTime<Utc>) -> Self {
        Self {
            remote_id,
            server_modified: Some(server_modified),
            checksum: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Full record for `item` carrying these values
    pub fn into_record(self, item: &SyncItem) -> ChangeRecord {
        ChangeRecord {
            local_path: item.local_relative().clone(),
            remote_path: item.remote_relative().clone(),
            remote_id: self.remote_id,
            is_folder: item.is_folder(),
            server_modified: self.server_modified,
            checksum: self.checksum,
            metadata: self.metadata,
        }
    }
}

/// Operation kinds that carry their own retry counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Download,
    Upload,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Download => "download",
            OperationKind::Upload => "upload",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
