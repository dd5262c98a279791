//! SyncItem domain value
//!
//! A [`SyncItem`] correlates one local filesystem entry with one remote
//! entry of the same folder pair. Items are built in two steps:
//!
//! ```text
//!   PartialItem::local(..)  ──┐
//!                             ├──► PathCorrelator::resolve ──► SyncItem
//!   PartialItem::remote(..) ──┘      (ChangeStore lookup)       (both paths)
//! ```
//!
//! Only one side is authoritative when an item is first observed; the other
//! side is derived from the change store. Once resolved, a `SyncItem` is
//! immutable: a rename produces a new item rather than mutating the old one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{RelativePath, RemotePath};

// ============================================================================
// FolderRoots
// ============================================================================

/// Per-folder-pair constants shared by every item of that pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRoots {
    /// Absolute local directory being synchronized
    pub local_root: PathBuf,
    /// Absolute remote folder being synchronized
    pub remote_root: RemotePath,
}

impl FolderRoots {
    pub fn new(local_root: impl Into<PathBuf>, remote_root: RemotePath) -> Self {
        Self {
            local_root: local_root.into(),
            remote_root,
        }
    }
}

// ============================================================================
// PartialItem
// ============================================================================

/// Which side a partial item was observed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOrigin {
    /// Found on the local filesystem; the remote path is still unknown
    Local(RelativePath),
    /// Found in the remote repository; the local path is still unknown
    Remote(RelativePath),
}

/// An item whose path is known on exactly one side
#[derive(Debug, Clone)]
pub struct PartialItem {
    roots: Arc<FolderRoots>,
    origin: PathOrigin,
    is_folder: bool,
}

impl PartialItem {
    /// Item first observed at a local relative path
    pub fn local(roots: Arc<FolderRoots>, path: RelativePath, is_folder: bool) -> Self {
        Self {
            roots,
            origin: PathOrigin::Local(path),
            is_folder,
        }
    }

    /// Item first observed at a remote relative path
    pub fn remote(roots: Arc<FolderRoots>, path: RelativePath, is_folder: bool) -> Self {
        Self {
            roots,
            origin: PathOrigin::Remote(path),
            is_folder,
        }
    }

    pub fn roots(&self) -> &Arc<FolderRoots> {
        &self.roots
    }

    pub fn origin(&self) -> &PathOrigin {
        &self.origin
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    /// Complete the item with the translated path of the other side
    pub fn resolve(self, other: RelativePath) -> SyncItem {
        let (local, remote) = match self.origin {
            PathOrigin::Local(local) => (local, other),
            PathOrigin::Remote(remote) => (other, remote),
        };
        SyncItem {
            roots: self.roots,
            local,
            remote,
            is_folder: self.is_folder,
        }
    }
}

// ============================================================================
// SyncItem
// ============================================================================

/// A correlated (local path, remote path) pair for one file or folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    roots: Arc<FolderRoots>,
    local: RelativePath,
    remote: RelativePath,
    is_folder: bool,
}

impl SyncItem {
    /// Build an item whose paths are both already known
    pub fn new(
        roots: Arc<FolderRoots>,
        local: RelativePath,
        remote: RelativePath,
        is_folder: bool,
    ) -> Self {
        Self {
            roots,
            local,
            remote,
            is_folder,
        }
    }

    /// The folder pair root itself
    pub fn root(roots: Arc<FolderRoots>) -> Self {
        Self::new(roots, RelativePath::root(), RelativePath::root(), true)
    }

    /// Child of a folder item carrying the same leaf name on both sides
    ///
    /// # Errors
    /// Returns `DomainError::InvalidName` if `name` is not a valid leaf name
    pub fn child(&self, name: &str, is_folder: bool) -> Result<Self, DomainError> {
        Ok(Self {
            roots: Arc::clone(&self.roots),
            local: self.local.join(name)?,
            remote: self.remote.join(name)?,
            is_folder,
        })
    }

    pub fn roots(&self) -> &Arc<FolderRoots> {
        &self.roots
    }

    /// Local path relative to the folder root
    pub fn local_relative(&self) -> &RelativePath {
        &self.local
    }

    /// Remote path relative to the folder root
    pub fn remote_relative(&self) -> &RelativePath {
        &self.remote
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn is_root(&self) -> bool {
        self.local.is_root()
    }

    /// Absolute local path (OS separators)
    pub fn local_path(&self) -> PathBuf {
        self.local.to_local(&self.roots.local_root)
    }

    /// Absolute remote path (protocol separators)
    pub fn remote_path(&self) -> RemotePath {
        self.roots.remote_root.join_relative(&self.remote)
    }

    /// Leaf name on the local side (empty for the root)
    pub fn local_name(&self) -> &str {
        self.local.file_name().unwrap_or("")
    }

    /// Leaf name on the remote side (empty for the root)
    pub fn remote_name(&self) -> &str {
        self.remote.file_name().unwrap_or("")
    }

    pub fn local_root(&self) -> &Path {
        &self.roots.local_root
    }
}

impl fmt::Display for SyncItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local == self.remote {
            write!(f, "{}", self.local)
        } else {
            write!(f, "{} <-> {}", self.local, self.remote)
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
