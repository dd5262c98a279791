//! User-visible conflict notices

use docsync_core::ports::{NoticeKind, Notification};

/// Notice for a keep-both resolution
///
/// Names the local user whose copy was set aside and the backup file.
pub fn conflict_notice(path: &str, backup_name: &str, user: &str) -> Notification {
    Notification::new(
        NoticeKind::Conflict,
        path,
        "Sync conflict",
        format!(
            "{path} was changed both locally and on the server. \
             The server version was kept; {user}'s local version was saved as {backup_name}."
        ),
    )
}

/// Notice for an update refused because someone holds the document
pub fn checked_out_notice(path: &str, holder: &str) -> Notification {
    Notification::new(
        NoticeKind::CheckedOut,
        path,
        "Document checked out",
        format!("{path} is checked out by {holder}. Local changes will be sent once it is checked in."),
    )
}
