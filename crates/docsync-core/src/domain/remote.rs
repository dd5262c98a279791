//! Remote object model
//!
//! Remote repositories expose many object kinds (documents, folders, links,
//! policies, ...). The engine only ever deals with three cases, decided once
//! when a child is enumerated: a folder, a document, or something it does not
//! synchronize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ChangeToken, RemoteId, RemotePath};

/// Kind of an enumerated remote child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Folder,
    Document {
        /// Content length in bytes
        size: u64,
        /// False when the server denies writing the content
        writable: bool,
        /// Holder of a checkout lock, if any
        checked_out_by: Option<String>,
    },
    /// Any other object type; the reason is kept for logging
    Unsupported(String),
}

/// One child of a remote folder, as returned by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: RemoteId,
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub kind: RemoteKind,
}

impl RemoteEntry {
    pub fn folder(id: RemoteId, name: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            last_modified,
            kind: RemoteKind::Folder,
        }
    }

    pub fn document(
        id: RemoteId,
        name: impl Into<String>,
        last_modified: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            last_modified,
            kind: RemoteKind::Document {
                size,
                writable: true,
                checked_out_by: None,
            },
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, RemoteKind::Folder)
    }

    pub fn is_document(&self) -> bool {
        matches!(self.kind, RemoteKind::Document { .. })
    }

    /// True for documents the server refuses to let us modify
    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, RemoteKind::Document { writable: false, .. })
    }
}

/// One object of a subtree listing, with the folder that holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescendant {
    pub parent: RemotePath,
    pub entry: RemoteEntry,
}

/// Optional protocol features, negotiated when a session is established
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCapabilities {
    /// The server issues change-log tokens and answers `get_changes`
    pub change_log: bool,
    /// The server can return a whole subtree in one request
    pub descendants: bool,
}

impl RemoteCapabilities {
    /// Apply per-folder overrides; an override can only turn a feature off
    #[must_use]
    pub fn restricted(self, change_log: Option<bool>, descendants: Option<bool>) -> Self {
        Self {
            change_log: self.change_log && change_log.unwrap_or(true),
            descendants: self.descendants && descendants.unwrap_or(true),
        }
    }
}

/// Metadata sent along with new document content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// What happened to a remote object according to the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One change-log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub id: RemoteId,
    pub kind: RemoteChangeKind,
    /// Current absolute path when the server reports it (absent for deletions)
    pub path: Option<RemotePath>,
}

/// Changes since a token, and the token to resume from next time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub changes: Vec<RemoteChange>,
    pub latest_token: ChangeToken,
}
