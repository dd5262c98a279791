//! Pass orchestration for one folder pair
//!
//! The [`SyncOrchestrator`] owns the remote session and decides, for each
//! pass, which engines run and in which order:
//!
//! ```text
//!  Disconnected ──connect──► Connected ──┬── no full sync yet ──► FirstSync
//!        ▲                               │      sweep, full crawl
//!        │ unauthorized                  │
//!        └───────────────────────────────┴── otherwise ─────────► Incremental
//!                                               watcher events, sweep,
//!                                               change-log scoped crawl
//!                                               or full crawl
//!                                                     │
//!                                                     ▼
//!                                                   Idle
//! ```
//!
//! Passes are single-flight: a pass requested while another one runs
//! returns [`PassStatus::Busy`] immediately.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use docsync_core::config::RepoInfo;
use docsync_core::domain::{
    ChangeSet, ChangeToken, FolderRoots, RelativePath, RemoteCapabilities, RemoteChange,
    RemoteChangeKind,
};
use docsync_core::ports::{
    IChangeStore, INotificationService, IRemoteConnector, IRemoteRepository, RemoteError,
};

use crate::context::SyncContext;
use crate::control::SyncControl;
use crate::correlator::PathCorrelator;
use crate::crawl::CrawlEngine;
use crate::failure::{classify, into_sync_error, remote_error, Failure};
use crate::filter::SyncFilter;
use crate::incremental::IncrementalEngine;
use crate::local;
use crate::retry::{with_retry, RetryPolicy};
use crate::sweep::LocalSweep;
use crate::watcher::{lock_queue, SharedWatcherQueue};
use crate::SyncError;

// ============================================================================
// State and reports
// ============================================================================

/// Where the orchestrator stands between and during passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connected,
    FirstSync,
    Incremental,
    Idle,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connected => "connected",
            SyncState::FirstSync => "first-sync",
            SyncState::Incremental => "incremental",
            SyncState::Idle => "idle",
        };
        write!(f, "{s}")
    }
}

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Everything converged
    Success,
    /// Some items failed; they are retried on the next pass
    Partial,
    /// Cancelled through [`SyncControl`]
    Aborted,
    /// Another pass was already running
    Busy,
}

/// Which kind of reconciliation a pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    FirstSync,
    Incremental,
    /// Incremental, with the crawl narrowed by the remote change log
    ChangeLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub status: PassStatus,
    pub mode: Option<PassMode>,
}

impl SyncReport {
    fn new(status: PassStatus, mode: Option<PassMode>) -> Self {
        Self { status, mode }
    }

    pub fn is_success(&self) -> bool {
        self.status == PassStatus::Success
    }
}

#[derive(Clone)]
struct Session {
    remote: Arc<dyn IRemoteRepository>,
    capabilities: RemoteCapabilities,
}

/// What the change log says must be crawled
enum RemoteScope {
    Folders(BTreeSet<RelativePath>),
    Everything,
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

/// Runs synchronization passes for one folder pair
pub struct SyncOrchestrator {
    repo: Arc<RepoInfo>,
    roots: Arc<FolderRoots>,
    connector: Arc<dyn IRemoteConnector>,
    store: Arc<dyn IChangeStore>,
    notifier: Arc<dyn INotificationService>,
    control: Arc<SyncControl>,
    filter: Arc<SyncFilter>,
    retry: RetryPolicy,
    watch_queue: Option<SharedWatcherQueue>,
    /// Single-flight lock; also guards the session
    pass: tokio::sync::Mutex<Option<Session>>,
    state: Mutex<SyncState>,
}

impl SyncOrchestrator {
    /// # Errors
    /// Fails when an ignore pattern of `repo` is not a valid glob.
    pub fn new(
        repo: Arc<RepoInfo>,
        connector: Arc<dyn IRemoteConnector>,
        store: Arc<dyn IChangeStore>,
        notifier: Arc<dyn INotificationService>,
        control: Arc<SyncControl>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let filter = SyncFilter::new(&repo.ignored_paths)
            .with_context(|| format!("Invalid ignore patterns for folder '{}'", repo.name))?;
        Ok(Self {
            roots: Arc::new(repo.roots()),
            repo,
            connector,
            store,
            notifier,
            control,
            filter: Arc::new(filter),
            retry,
            watch_queue: None,
            pass: tokio::sync::Mutex::new(None),
            state: Mutex::new(SyncState::Disconnected),
        })
    }

    /// Feed watcher events into incremental passes
    #[must_use]
    pub fn with_watch_queue(mut self, queue: SharedWatcherQueue) -> Self {
        self.watch_queue = Some(queue);
        self
    }

    pub fn repo(&self) -> &Arc<RepoInfo> {
        &self.repo
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    pub fn control(&self) -> &Arc<SyncControl> {
        &self.control
    }

    fn set_state(&self, next: SyncState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = %*state, to = %next, "State change");
            *state = next;
        }
    }

    /// Run one pass
    ///
    /// # Errors
    /// Returns [`SyncError::Fatal`] when the local root is missing and
    /// [`SyncError::Systemic`] when the remote is unusable. Neither persists
    /// the change-log token.
    #[tracing::instrument(skip(self), fields(folder = %self.repo.name))]
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let Ok(mut session) = self.pass.try_lock() else {
            debug!("A pass is already running");
            return Ok(SyncReport::new(PassStatus::Busy, None));
        };
        let _pass = self.control.start_pass();
        let started = std::time::Instant::now();

        let result = self.run_pass(&mut session).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(report) => {
                self.set_state(SyncState::Idle);
                info!(status = ?report.status, mode = ?report.mode, elapsed_ms, "Pass finished");
                Ok(report)
            }
            Err(SyncError::Aborted) => {
                self.set_state(if session.is_some() {
                    SyncState::Connected
                } else {
                    SyncState::Disconnected
                });
                info!(elapsed_ms, "Pass aborted");
                Ok(SyncReport::new(PassStatus::Aborted, None))
            }
            Err(err) => {
                if let SyncError::Systemic(cause) = &err {
                    if matches!(remote_error(cause), Some(RemoteError::Unauthorized(_))) {
                        warn!("Remote session no longer authorized, reconnecting next pass");
                        *session = None;
                    }
                }
                self.set_state(if session.is_some() {
                    SyncState::Connected
                } else {
                    SyncState::Disconnected
                });
                error!(error = %format!("{err:#}"), elapsed_ms, "Pass failed");
                Err(err)
            }
        }
    }

    async fn run_pass(&self, slot: &mut Option<Session>) -> Result<SyncReport, SyncError> {
        let root = &self.roots.local_root;
        if !local::is_dir(root).await {
            return Err(SyncError::Fatal(format!(
                "Local root {} is missing",
                root.display()
            )));
        }
        self.control.checkpoint().await?;

        let session = self.ensure_session(slot).await?;
        let ctx = Arc::new(SyncContext {
            repo: Arc::clone(&self.repo),
            roots: Arc::clone(&self.roots),
            remote: Arc::clone(&session.remote),
            capabilities: session.capabilities,
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            control: Arc::clone(&self.control),
            filter: Arc::clone(&self.filter),
            retry: self.retry,
        });

        // Read before anything runs, so changes made during the pass are
        // seen again by the next one
        let fresh_token = if session.capabilities.change_log {
            let remote = &session.remote;
            let token = with_retry(self.retry, "change_log_token", || async move {
                remote.change_log_token().await
            })
            .await
            .map_err(into_sync_error)?;
            Some(token)
        } else {
            None
        };

        let first_sync = self
            .store
            .last_full_sync()
            .await
            .map_err(into_sync_error)?
            .is_none();

        let (ok, mode) = if first_sync {
            self.first_sync(&ctx).await?
        } else {
            self.incremental(&ctx).await?
        };

        if !ok {
            info!("Pass incomplete, change-log token kept");
            return Ok(SyncReport::new(PassStatus::Partial, Some(mode)));
        }

        if let Some(token) = &fresh_token {
            self.store
                .set_change_log_token(token)
                .await
                .map_err(into_sync_error)?;
        }
        if mode != PassMode::ChangeLog {
            self.store
                .mark_full_sync(Utc::now())
                .await
                .map_err(into_sync_error)?;
        }
        Ok(SyncReport::new(PassStatus::Success, Some(mode)))
    }

    async fn ensure_session(&self, slot: &mut Option<Session>) -> Result<Session, SyncError> {
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let connector = &self.connector;
        let remote = with_retry(self.retry, "connect", || async move {
            connector.connect().await
        })
        .await
        .map_err(into_sync_error)?;

        let capabilities = remote
            .capabilities()
            .restricted(self.repo.change_log, self.repo.descendants);
        info!(
            change_log = capabilities.change_log,
            descendants = capabilities.descendants,
            "Connected to remote repository"
        );

        let session = Session {
            remote,
            capabilities,
        };
        *slot = Some(session.clone());
        self.set_state(SyncState::Connected);
        Ok(session)
    }

    async fn first_sync(&self, ctx: &Arc<SyncContext>) -> Result<(bool, PassMode), SyncError> {
        self.set_state(SyncState::FirstSync);
        info!("Starting first synchronization");

        // The full crawl sees everything the watcher reported so far
        let dropped = self.drain_watcher().len();
        if dropped > 0 {
            debug!(events = dropped, "Watcher events superseded by the full crawl");
        }

        let mut ok = LocalSweep::new(Arc::clone(ctx)).sweep().await?;
        ok &= CrawlEngine::new(Arc::clone(ctx)).crawl_root().await?;
        Ok((ok, PassMode::FirstSync))
    }

    async fn incremental(&self, ctx: &Arc<SyncContext>) -> Result<(bool, PassMode), SyncError> {
        self.set_state(SyncState::Incremental);

        let mut ok = true;
        let mut rescan = BTreeSet::new();

        let events = self.drain_watcher();
        if !events.is_empty() {
            let outcome = IncrementalEngine::new(Arc::clone(ctx))
                .watcher_sync(events)
                .await?;
            ok &= outcome.success;
            rescan = outcome.rescan;
        }

        ok &= LocalSweep::new(Arc::clone(ctx)).sweep().await?;

        let crawl = CrawlEngine::new(Arc::clone(ctx));
        let scope = self.remote_scope(ctx).await?;
        match scope {
            Some(RemoteScope::Folders(mut folders)) => {
                folders.append(&mut rescan);
                debug!(folders = folders.len(), "Change-log scoped crawl");
                ok &= crawl.crawl_scope(&folders).await?;
                Ok((ok, PassMode::ChangeLog))
            }
            Some(RemoteScope::Everything) | None => {
                ok &= crawl.crawl_root().await?;
                Ok((ok, PassMode::Incremental))
            }
        }
    }

    /// Events whose pairing window has passed
    fn drain_watcher(&self) -> Vec<crate::watcher::WatcherEvent> {
        match &self.watch_queue {
            Some(queue) => lock_queue(queue).drain_ready(Instant::now()),
            None => Vec::new(),
        }
    }

    /// Folders touched remotely since the stored token
    ///
    /// `None` when the change log is unavailable or no token is stored yet.
    async fn remote_scope(&self, ctx: &SyncContext) -> Result<Option<RemoteScope>, SyncError> {
        if !ctx.capabilities.change_log {
            return Ok(None);
        }
        let Some(since) = self.store.change_log_token().await.map_err(into_sync_error)? else {
            return Ok(None);
        };

        let changes = match self.fetch_changes(ctx, &since).await {
            Ok(changes) => changes,
            Err(err) if classify(&err) == Failure::Item => {
                warn!(error = %format!("{err:#}"), "Change log rejected the stored token, crawling everything");
                return Ok(Some(RemoteScope::Everything));
            }
            Err(err) => return Err(into_sync_error(err)),
        };
        debug!(changes = changes.changes.len(), "Remote changes since last pass");

        let correlator = PathCorrelator::new(Arc::clone(&self.store), Arc::clone(&self.roots));
        let mut folders = BTreeSet::new();
        for change in &changes.changes {
            ctx.control.checkpoint().await?;
            let placed = self
                .collect(&correlator, change, &mut folders)
                .await
                .map_err(into_sync_error)?;
            if !placed && change.kind != RemoteChangeKind::Deleted {
                debug!(id = %change.id, "Cannot place remote change, crawling everything");
                return Ok(Some(RemoteScope::Everything));
            }
        }
        Ok(Some(RemoteScope::Folders(folders)))
    }

    async fn fetch_changes(&self, ctx: &SyncContext, since: &ChangeToken) -> Result<ChangeSet> {
        let remote = &ctx.remote;
        with_retry(self.retry, "get_changes", || async move {
            remote.get_changes(since).await
        })
        .await
    }

    /// Add the local parent folders affected by `change` to `folders`
    ///
    /// Returns false when neither the change nor a record tells where it
    /// happened. A deletion of something never synchronized needs nothing.
    async fn collect(
        &self,
        correlator: &PathCorrelator,
        change: &RemoteChange,
        folders: &mut BTreeSet<RelativePath>,
    ) -> Result<bool> {
        let parent = |p: &RelativePath| p.parent().unwrap_or_else(RelativePath::root);
        let mut placed = false;

        // Where the object used to be
        if let Some(record) = self.store.lookup_by_remote_id(&change.id).await? {
            folders.insert(parent(&record.local_path));
            placed = true;
        }
        // Where it is now
        if let Some(path) = &change.path {
            match path.relative_to(&self.roots.remote_root) {
                Some(relative) if !relative.is_root() => {
                    let local = correlator.local_of(&relative).await?;
                    folders.insert(parent(&local));
                }
                Some(_) => {}
                None => trace!(path = %path, "Change outside the synchronized folder"),
            }
            placed = true;
        }
        Ok(placed)
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("folder", &self.repo.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
