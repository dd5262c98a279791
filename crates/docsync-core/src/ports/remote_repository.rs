//! Remote repository port (driven/secondary port)
//!
//! This module defines the interface the engine needs from a hierarchical
//! document repository. Any CMIS-like document API satisfies it; the
//! workspace ships a directory-backed adapter in `docsync-mirror`.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific.
//!   Adapters that want the engine to react to a specific failure (checked-out
//!   documents, lost sessions, ...) return a [`RemoteError`] inside the
//!   `anyhow::Error`; the engine finds it by walking the error chain.
//! - Mutating calls return the resulting [`RemoteEntry`] so the caller learns
//!   the object id and the server-side modification time in one round trip.
//! - Sessions are not shared across folder pairs. An [`IRemoteConnector`]
//!   creates a fresh session whenever the previous one was dropped.

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::newtypes::{ChangeToken, RemoteId, RemotePath};
use crate::domain::remote::{
    ChangeSet, DocumentMetadata, RemoteCapabilities, RemoteDescendant, RemoteEntry,
};

/// Streamed document content
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// RemoteError
// ============================================================================

/// Typed failures reported by remote adapters
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Naming, versioning or content constraint rejected by the server
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Document is checked out by {by}")]
    CheckedOut { by: String },

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Session is no longer authorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    /// True for errors that concern the whole session rather than one object
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection(_) | RemoteError::NotSupported(_) | RemoteError::Unauthorized(_)
        )
    }
}

// ============================================================================
// IRemoteRepository
// ============================================================================

/// Port trait for one session against a remote document repository
///
/// All paths are absolute remote paths. Implementations must return
/// children in a stable order so that first-seen tie breaking among
/// duplicate names is deterministic.
#[async_trait::async_trait]
pub trait IRemoteRepository: Send + Sync {
    /// Optional features supported by this session
    fn capabilities(&self) -> RemoteCapabilities;

    /// Lists the children of a folder
    async fn get_children(&self, folder: &RemotePath) -> anyhow::Result<Vec<RemoteEntry>>;

    /// Lists every object below `folder`, each with the folder holding it
    ///
    /// Parents come before their children. Only called when
    /// `capabilities().descendants` is true.
    async fn get_descendants(
        &self,
        folder: &RemotePath,
    ) -> anyhow::Result<Vec<RemoteDescendant>> {
        Err(RemoteError::NotSupported(format!("descendants of {folder}")).into())
    }

    /// Looks up a single object by path
    ///
    /// # Returns
    /// `None` when nothing exists at `path`
    async fn get_entry(&self, path: &RemotePath) -> anyhow::Result<Option<RemoteEntry>>;

    /// Opens the content of a document for reading
    async fn get_content(&self, id: &RemoteId) -> anyhow::Result<ContentStream>;

    /// Replaces the content of an existing document
    async fn set_content(
        &self,
        id: &RemoteId,
        content: ContentStream,
        metadata: &DocumentMetadata,
    ) -> anyhow::Result<RemoteEntry>;

    /// Creates a new document below `parent`
    async fn create_document(
        &self,
        parent: &RemotePath,
        name: &str,
        content: ContentStream,
        metadata: &DocumentMetadata,
    ) -> anyhow::Result<RemoteEntry>;

    /// Creates a new folder below `parent`
    async fn create_folder(&self, parent: &RemotePath, name: &str) -> anyhow::Result<RemoteEntry>;

    /// Deletes an object; folders require `recursive` unless empty
    async fn delete(&self, id: &RemoteId, recursive: bool) -> anyhow::Result<()>;

    /// Renames an object in place, preserving its identity
    async fn rename(&self, id: &RemoteId, new_name: &str) -> anyhow::Result<RemoteEntry>;

    /// Moves an object to another folder, preserving its identity
    async fn move_object(
        &self,
        id: &RemoteId,
        from: &RemotePath,
        to: &RemotePath,
    ) -> anyhow::Result<RemoteEntry>;

    /// Current change-log position
    ///
    /// Fails with [`RemoteError::NotSupported`] when `capabilities().change_log`
    /// is false.
    async fn change_log_token(&self) -> anyhow::Result<ChangeToken>;

    /// Changes recorded after `since`
    async fn get_changes(&self, since: &ChangeToken) -> anyhow::Result<ChangeSet>;
}

// ============================================================================
// IRemoteConnector
// ============================================================================

/// Factory for remote sessions
///
/// The orchestrator calls `connect` when it has no session, and again after
/// a session was dropped because the server reported it as unauthorized.
#[async_trait::async_trait]
pub trait IRemoteConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<std::sync::Arc<dyn IRemoteRepository>>;
}
