//! Divergence detection
//!
//! Decides, for one tracked document, which side changed since the last
//! synchronization. The remote side changed when the server reports a
//! modification time newer than the recorded one; the local side changed
//! when the live checksum differs from the recorded checksum. Local
//! modification times are never consulted.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use docsync_core::domain::{ChangeRecord, Checksum};

/// How a document differs from its last synchronized state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// No record exists: the item was never synchronized
    FirstContact,
    /// Neither side changed
    InSync,
    /// Only the local copy changed
    LocalChanged,
    /// Only the remote copy changed
    RemoteChanged,
    /// Both sides changed since the last sync
    Conflict,
}

impl Divergence {
    /// True when the remote version has to be installed locally
    pub fn needs_download(&self) -> bool {
        matches!(
            self,
            Divergence::FirstContact | Divergence::RemoteChanged | Divergence::Conflict
        )
    }

    /// True when the local version has to be pushed
    pub fn needs_upload(&self) -> bool {
        matches!(self, Divergence::LocalChanged)
    }
}

/// Stateless divergence classifier
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies a document present on both sides
    ///
    /// `live_checksum` is `None` when the local file could not be hashed
    /// (for instance because it vanished); the local side is then treated
    /// as unchanged.
    pub fn classify(
        record: Option<&ChangeRecord>,
        remote_modified: DateTime<Utc>,
        live_checksum: Option<&Checksum>,
    ) -> Divergence {
        let Some(record) = record else {
            return Divergence::FirstContact;
        };

        let remote_changed = record.is_remote_newer(remote_modified);
        let local_changed = live_checksum.is_some_and(|live| record.is_dirty(live));

        let divergence = match (remote_changed, local_changed) {
            (true, true) => Divergence::Conflict,
            (true, false) => Divergence::RemoteChanged,
            (false, true) => Divergence::LocalChanged,
            (false, false) => Divergence::InSync,
        };

        if divergence == Divergence::Conflict {
            info!(
                path = %record.local_path,
                recorded = ?record.server_modified,
                remote = %remote_modified,
                "Conflict detected: both local and remote versions changed"
            );
        } else {
            debug!(path = %record.local_path, ?divergence, "Divergence classified");
        }

        divergence
    }

    /// True when a local entry and a remote entry of the same name differ in kind
    pub fn is_type_collision(local_is_folder: bool, remote_is_folder: bool) -> bool {
        local_is_folder != remote_is_folder
    }
}
