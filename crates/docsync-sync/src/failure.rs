//! Failure classification
//!
//! Every error raised while synchronizing one object falls into one of
//! four classes. Only [`Failure::Item`] is absorbed by the engines; the
//! other classes end the pass.

use std::io;

use tracing::warn;

use docsync_conflict::ConflictError;
use docsync_core::domain::DomainError;
use docsync_core::ports::RemoteError;

use crate::SyncError;

/// Message fragments that mark an otherwise untyped error as a network failure
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "reset by peer",
    "broken pipe",
    "dns",
];

/// How far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Concerns one object; log, count, keep going
    Item,
    /// The remote session is unusable
    Systemic,
    /// The folder pair cannot be synchronized
    Fatal,
    /// The pass was cancelled
    Aborted,
}

/// True when an untyped error message looks like a network failure
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// The first [`RemoteError`] in the chain of `err`
pub fn remote_error(err: &anyhow::Error) -> Option<&RemoteError> {
    err.chain().find_map(|e| e.downcast_ref::<RemoteError>())
}

/// Classify `err` by walking its source chain
pub fn classify(err: &anyhow::Error) -> Failure {
    for cause in err.chain() {
        if let Some(sync) = cause.downcast_ref::<SyncError>() {
            return match sync {
                SyncError::Aborted => Failure::Aborted,
                SyncError::Fatal(_) => Failure::Fatal,
                SyncError::Systemic(_) => Failure::Systemic,
            };
        }
        if let Some(remote) = cause.downcast_ref::<RemoteError>() {
            return if remote.is_systemic() {
                Failure::Systemic
            } else {
                Failure::Item
            };
        }
        if cause.downcast_ref::<DomainError>().is_some()
            || cause.downcast_ref::<ConflictError>().is_some()
            || cause.downcast_ref::<io::Error>().is_some()
        {
            return Failure::Item;
        }
    }

    if is_transient_message(&format!("{err:#}")) {
        Failure::Systemic
    } else {
        Failure::Item
    }
}

/// Absorb item failures, turn everything else into a pass-level error
///
/// # Errors
/// Returns the [`SyncError`] matching the class of `err` unless it is an
/// item failure.
pub fn escalate(err: anyhow::Error) -> Result<(), SyncError> {
    match classify(&err) {
        Failure::Item => {
            warn!(error = %format!("{err:#}"), "Item failed, continuing");
            Ok(())
        }
        _ => Err(into_sync_error(err)),
    }
}

/// Convert a non-item error into a [`SyncError`], unwrapping it if it already is one
pub fn into_sync_error(err: anyhow::Error) -> SyncError {
    let class = classify(&err);
    match err.downcast::<SyncError>() {
        Ok(sync) => sync,
        Err(err) => match class {
            Failure::Aborted => SyncError::Aborted,
            Failure::Fatal => SyncError::Fatal(format!("{err:#}")),
            Failure::Systemic | Failure::Item => SyncError::Systemic(err),
        },
    }
}

/// Outcome of one step as a success flag
///
/// `Ok(flag)` passes through, item failures become `Ok(false)`, and any
/// other failure ends the pass.
pub fn settle(result: anyhow::Result<bool>) -> Result<bool, SyncError> {
    match result {
        Ok(ok) => Ok(ok),
        Err(err) => escalate(err).map(|()| false),
    }
}
