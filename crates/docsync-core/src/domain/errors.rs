//! Domain error types
//!
//! Validation failures raised while constructing domain values. These are
//! always local to a single item; the engine treats them as item failures.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path (absolute, traversal, or empty component)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A single path component is not a valid leaf name
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid checksum format (expected lowercase SHA-256 hex)
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    /// Path is not within the configured folder root
    #[error("Path not within folder root: {0}")]
    PathNotInRoot(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid remote object ID
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Invalid change-log token
    #[error("Invalid change-log token: {0}")]
    InvalidChangeToken(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
