//! docsync Sync - Synchronization engine
//!
//! Keeps one local directory and one remote folder identical in both
//! directions.
//!
//! ## Modules
//!
//! - [`orchestrator`] - Per-folder state machine that decides the pass kind
//! - [`crawl`] - Full recursive reconciliation of a folder
//! - [`incremental`] - Replays watcher events as remote operations
//! - [`sweep`] - Pushes local-only changes found by walking the tree
//! - [`operations`] - Primitive transfers that keep the change store current
//! - [`correlator`] - Local/remote path translation through the change store
//! - [`watcher`] - Filesystem watcher and its event-collapsing queue
//! - [`scheduler`] - Timer / activity driven pass loop
//! - [`filter`] - Worth-syncing rules
//! - [`control`] - Cooperative suspend and cancellation
//! - [`failure`] - Error classification
//! - [`retry`] - In-operation backoff for transient errors
//! - [`local`] - Local filesystem helpers (streaming hashes, atomic install)

pub mod context;
pub mod control;
pub mod correlator;
pub mod crawl;
pub mod failure;
pub mod filter;
pub mod incremental;
pub mod local;
pub mod operations;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod sweep;
pub mod watcher;

pub use context::SyncContext;
pub use control::SyncControl;
pub use correlator::PathCorrelator;
pub use crawl::CrawlEngine;
pub use filter::SyncFilter;
pub use incremental::{IncrementalEngine, WatcherOutcome};
pub use operations::OperationsExecutor;
pub use orchestrator::{PassMode, PassStatus, SyncOrchestrator, SyncReport, SyncState};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerHandle, SyncScheduler, Synchronize};
pub use sweep::LocalSweep;
pub use watcher::{ChangeEvent, LocalWatcher, SharedWatcherQueue, WatcherEvent, WatcherQueue};

use thiserror::Error;

/// Pass-level failures
///
/// Per-object failures never appear here: they are logged, counted, and
/// turned into a `false` success flag. Only conditions that stop the whole
/// pass are carried as `SyncError`.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The pass was cancelled through [`SyncControl`]
    #[error("Synchronization aborted")]
    Aborted,

    /// The folder pair cannot be synchronized at all (e.g. local root missing)
    #[error("Fatal: {0}")]
    Fatal(String),

    /// The remote session is unusable (connection lost, unauthorized, ...)
    #[error("Remote unavailable: {0}")]
    Systemic(#[source] anyhow::Error),
}
