//! Notification service port (driven/secondary port)
//!
//! Only two kinds of event reach the user: a conflict that was resolved by
//! setting the local copy aside, and a local change that cannot be sent
//! because someone else holds the document. Everything else is log-only.
//!
//! Delivery is fire-and-forget; callers log and ignore a failed `notify`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Both sides changed; the local copy was backed up under a new name
    Conflict,
    /// An update was refused because the document is checked out
    CheckedOut,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoticeKind::Conflict => "conflict",
            NoticeKind::CheckedOut => "checked_out",
        })
    }
}

/// A message for the user about one synchronized path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NoticeKind,
    /// Path relative to the folder root
    pub path: String,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        kind: NoticeKind,
        path: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Port trait for user-visible notices
///
/// Implementations should swallow delivery problems (missing notification
/// daemon, closed channel) and return `Ok`.
#[async_trait::async_trait]
pub trait INotificationService: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Notification sink that writes to the log
///
/// Used when no desktop integration is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl INotificationService for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::warn!(
            kind = %notification.kind,
            path = %notification.path,
            "{}: {}",
            notification.title,
            notification.body
        );
        Ok(())
    }
}
