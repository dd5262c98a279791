//! Error types for the mirror adapter.
//!
//! Defines `MirrorError` and its conversion to the engine's [`RemoteError`].

use std::io;
use std::path::Path;

use thiserror::Error;

use docsync_core::ports::RemoteError;

/// Errors that can occur while serving a directory as a remote repository.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("mirror base unavailable: {0}")]
    BaseUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl MirrorError {
    /// Classify an I/O failure on `path`
    pub fn io(path: &Path, err: io::Error) -> Self {
        let what = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => MirrorError::NotFound(what),
            io::ErrorKind::PermissionDenied => MirrorError::PermissionDenied(what),
            io::ErrorKind::AlreadyExists => MirrorError::AlreadyExists(what),
            _ => MirrorError::Io {
                path: what,
                source: err,
            },
        }
    }
}

impl From<MirrorError> for RemoteError {
    fn from(err: MirrorError) -> RemoteError {
        match err {
            MirrorError::BaseUnavailable(what) => RemoteError::Connection(what),
            MirrorError::NotFound(what) => RemoteError::NotFound(what),
            MirrorError::PermissionDenied(what) => RemoteError::PermissionDenied(what),
            MirrorError::AlreadyExists(what) => RemoteError::Constraint(format!("{what} already exists")),
            MirrorError::NotEmpty(what) => RemoteError::Constraint(format!("{what} is not empty")),
            MirrorError::NotADirectory(what) => RemoteError::InvalidArgument(format!("{what} is not a folder")),
            MirrorError::IsADirectory(what) => RemoteError::InvalidArgument(format!("{what} is a folder")),
            MirrorError::InvalidArgument(what) => RemoteError::InvalidArgument(what),
            MirrorError::Io { path, source } => RemoteError::Connection(format!("{path}: {source}")),
        }
    }
}

/// Wrap a mirror failure the way the engine expects it
pub(crate) fn remote(err: MirrorError) -> anyhow::Error {
    RemoteError::from(err).into()
}
