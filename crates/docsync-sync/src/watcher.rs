//! File watching and the event-collapsing queue
//!
//! Provides a [`LocalWatcher`] that wraps the `notify` crate to monitor a
//! folder root, converting raw OS events into [`ChangeEvent`] values and
//! pushing them into a shared [`WatcherQueue`].
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue
//!       │   (notify thread)
//!       ▼
//!  LocalWatcher ──push──► Mutex<WatcherQueue> ──drain_ready──► IncrementalEngine
//!       │                                                           ▲
//!       └──────────── Notify (activity) ──► SyncScheduler ──────────┘
//! ```
//!
//! The queue collapses what editors and file managers actually emit:
//!
//! - a delete followed by a create of the same leaf name in another folder
//!   is a move;
//! - a delete followed by a create of the same path is a save-by-replace
//!   and becomes a modification;
//! - a create followed by a delete cancels out;
//! - a modification superseded by a later one on the same path is dropped.
//!
//! Deletions are held back for the pairing window so the matching create
//! can still arrive, and carry a grace deadline before which the engine
//! does not act on them.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use docsync_core::config::WatcherConfig;

// ============================================================================
// ChangeEvent
// ============================================================================

/// Represents a filesystem change event detected by the watcher
///
/// Paths are absolute, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new file or directory was created at the given path
    Created(PathBuf),
    /// An existing file was modified
    Modified(PathBuf),
    /// A file or directory was deleted from the given path
    Deleted(PathBuf),
    /// A file or directory was renamed or moved
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// Primary path of the event (the destination for renames)
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

/// A queued change with its timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub change: ChangeEvent,
    pub received: Instant,
    /// Deletions only: do not act before this instant
    pub grace_deadline: Option<Instant>,
}

impl WatcherEvent {
    pub fn new(change: ChangeEvent, received: Instant) -> Self {
        Self {
            change,
            received,
            grace_deadline: None,
        }
    }
}

// ============================================================================
// Event mapping - notify::Event → ChangeEvent
// ============================================================================

/// Converts a `notify::Event` into our internal `ChangeEvent`
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> `ChangeEvent::Created`
/// - `Modify(Data(*))` / `Modify(Any)` -> `ChangeEvent::Modified`
/// - `Modify(Name(Both))` with 2 paths -> `ChangeEvent::Renamed`
/// - `Modify(Name(From))` -> `ChangeEvent::Deleted`
/// - `Modify(Name(To))` -> `ChangeEvent::Created`
/// - `Remove(*)` -> `ChangeEvent::Deleted`
///
/// Metadata-only changes carry nothing to synchronize and are dropped, as
/// are access events and events without paths.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    let mapped = match &event.kind {
        EventKind::Create(_) => ChangeEvent::Created(paths.first()?.clone()),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            ChangeEvent::Modified(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if paths.len() >= 2 {
                ChangeEvent::Renamed {
                    old: paths[0].clone(),
                    new: paths[1].clone(),
                }
            } else {
                ChangeEvent::Modified(paths.first()?.clone())
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            ChangeEvent::Deleted(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            ChangeEvent::Created(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(_)) => ChangeEvent::Modified(paths.first()?.clone()),
        EventKind::Remove(_) => ChangeEvent::Deleted(paths.first()?.clone()),
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    debug!(event = ?mapped, "Mapped notify event");
    Some(mapped)
}

// ============================================================================
// WatcherQueue
// ============================================================================

/// Ordered, collapsing queue of local changes
#[derive(Debug)]
pub struct WatcherQueue {
    pending: VecDeque<WatcherEvent>,
    grace: Duration,
    pairing_window: Duration,
}

/// Queue shared between the notify thread and the sync worker
pub type SharedWatcherQueue = Arc<Mutex<WatcherQueue>>;

fn same_leaf(a: &Path, b: &Path) -> bool {
    a.file_name().is_some() && a.file_name() == b.file_name()
}

impl WatcherQueue {
    pub fn new(grace: Duration, pairing_window: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            grace,
            pairing_window,
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(config.grace(), config.pairing_window())
    }

    pub fn shared(self) -> SharedWatcherQueue {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&WatcherEvent) -> bool,
    {
        self.pending.iter().rposition(pred)
    }

    fn remove_where<F>(&mut self, pred: F)
    where
        F: Fn(&ChangeEvent) -> bool,
    {
        self.pending.retain(|e| !pred(&e.change));
    }

    /// Enqueue a change observed now
    pub fn push(&mut self, change: ChangeEvent) {
        self.push_at(change, Instant::now());
    }

    /// Enqueue a change observed at `now`
    pub fn push_at(&mut self, change: ChangeEvent, now: Instant) {
        trace!(event = ?change, "Enqueuing change event");
        match change {
            ChangeEvent::Created(path) => self.push_created(path, now),
            ChangeEvent::Modified(path) => self.push_modified(path, now),
            ChangeEvent::Deleted(path) => self.push_deleted(path, now),
            ChangeEvent::Renamed { old, new } => self.push_renamed(old, new, now),
        }
    }

    fn push_created(&mut self, path: PathBuf, now: Instant) {
        // Delete then recreate of the same path: an editor replaced the file
        if let Some(i) = self.position(|e| matches!(&e.change, ChangeEvent::Deleted(d) if *d == path)) {
            debug!(path = %path.display(), "Delete + create collapsed to modification");
            let received = self.pending[i].received;
            self.pending[i] = WatcherEvent::new(ChangeEvent::Modified(path), received);
            return;
        }

        let window = self.pairing_window;
        let paired = self.position(|e| match &e.change {
            ChangeEvent::Deleted(d) => {
                same_leaf(d, &path)
                    && d.parent() != path.parent()
                    && now.saturating_duration_since(e.received) <= window
            }
            _ => false,
        });
        if let Some(i) = paired {
            let old = self.pending[i].change.path().to_path_buf();
            debug!(old = %old.display(), new = %path.display(), "Delete + create collapsed to move");
            let received = self.pending[i].received;
            self.pending[i] = WatcherEvent::new(ChangeEvent::Renamed { old, new: path }, received);
            return;
        }

        self.pending
            .push_back(WatcherEvent::new(ChangeEvent::Created(path), now));
    }

    fn push_modified(&mut self, path: PathBuf, now: Instant) {
        let covered = self.pending.iter().any(|e| match &e.change {
            ChangeEvent::Created(p) => *p == path,
            ChangeEvent::Renamed { new, .. } => *new == path,
            _ => false,
        });
        if covered {
            return;
        }
        self.remove_where(|c| matches!(c, ChangeEvent::Modified(p) if *p == path));
        self.pending
            .push_back(WatcherEvent::new(ChangeEvent::Modified(path), now));
    }

    fn push_deleted(&mut self, path: PathBuf, now: Instant) {
        if let Some(i) = self.position(|e| matches!(&e.change, ChangeEvent::Created(c) if *c == path)) {
            debug!(path = %path.display(), "Create + delete cancelled out");
            self.pending.remove(i);
            self.remove_where(|c| matches!(c, ChangeEvent::Modified(p) if *p == path));
            return;
        }
        self.remove_where(|c| matches!(c, ChangeEvent::Modified(p) if *p == path));

        let mut event = WatcherEvent::new(ChangeEvent::Deleted(path), now);
        event.grace_deadline = Some(now + self.grace);
        self.pending.push_back(event);
    }

    fn push_renamed(&mut self, old: PathBuf, new: PathBuf, now: Instant) {
        let duplicate = self.pending.iter().any(|e| {
            matches!(&e.change, ChangeEvent::Renamed { old: o, new: n } if *o == old && *n == new)
        });
        if duplicate {
            return;
        }

        // The From/To halves of this rename may already be queued
        self.remove_where(|c| match c {
            ChangeEvent::Deleted(d) => *d == old,
            ChangeEvent::Created(c) => *c == new,
            _ => false,
        });

        // Renaming a file that was never synchronized is just a create
        if let Some(i) = self.position(|e| matches!(&e.change, ChangeEvent::Created(c) if *c == old)) {
            self.pending[i].change = ChangeEvent::Created(new);
            return;
        }

        self.remove_where(|c| matches!(c, ChangeEvent::Modified(p) if *p == old));
        self.pending
            .push_back(WatcherEvent::new(ChangeEvent::Renamed { old, new }, now));
    }

    /// Remove and return events that may be processed at `now`
    ///
    /// Order is preserved: draining stops at the first deletion still inside
    /// its pairing window.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<WatcherEvent> {
        let mut ready = Vec::new();
        while let Some(front) = self.pending.front() {
            let held = matches!(front.change, ChangeEvent::Deleted(_))
                && now.saturating_duration_since(front.received) < self.pairing_window;
            if held {
                break;
            }
            if let Some(event) = self.pending.pop_front() {
                ready.push(event);
            }
        }
        if !ready.is_empty() {
            debug!(count = ready.len(), left = self.pending.len(), "Drained watcher events");
        }
        ready
    }
}

/// Lock a shared queue, recovering from a poisoned mutex
pub fn lock_queue(queue: &SharedWatcherQueue) -> std::sync::MutexGuard<'_, WatcherQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// LocalWatcher
// ============================================================================

/// Watches a folder root recursively using the OS-native mechanism
///
/// Dropping the watcher stops event delivery.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    queue: SharedWatcherQueue,
    activity: Arc<Notify>,
}

impl LocalWatcher {
    /// Start watching `root`
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created or the
    /// root cannot be watched (missing, permissions, inotify limit reached)
    pub fn start(root: &Path, config: &WatcherConfig) -> Result<Self> {
        let queue = WatcherQueue::from_config(config).shared();
        let activity = Arc::new(Notify::new());

        info!(root = %root.display(), grace_secs = config.grace_secs, "Starting local watcher");

        let callback_queue = Arc::clone(&queue);
        let callback_activity = Arc::clone(&activity);
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        lock_queue(&callback_queue).push(change);
                        callback_activity.notify_one();
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
            queue,
            activity,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> SharedWatcherQueue {
        Arc::clone(&self.queue)
    }

    /// Signalled after every queued event
    pub fn activity(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }
}
