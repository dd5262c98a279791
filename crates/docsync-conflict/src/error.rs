//! Error types for conflict handling

use thiserror::Error;

/// Errors that can occur while resolving a conflict
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// Every candidate conflict name is already taken
    #[error("no free conflict name for {0}")]
    NamesExhausted(String),

    /// The name to back up is empty or not a single path component
    #[error("invalid name for conflict copy: {0}")]
    InvalidName(String),
}
