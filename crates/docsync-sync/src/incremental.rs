//! Watcher-driven synchronization
//!
//! Consumes the collapsed events drained from the [`WatcherQueue`] in
//! arrival order and pushes the corresponding local changes. Anything that
//! cannot be decided from the event alone (deletions, moves between
//! unrelated names, items under folders that are not synchronized yet) is
//! handed back as a folder to rescan, which the orchestrator merges into
//! the crawl scope.
//!
//! [`WatcherQueue`]: crate::watcher::WatcherQueue

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, trace};

use docsync_core::domain::{ChangeRecord, RelativePath, RemoteEntry, SyncItem};

use crate::context::SyncContext;
use crate::correlator::PathCorrelator;
use crate::failure::settle;
use crate::local::{self, LocalKind};
use crate::operations::OperationsExecutor;
use crate::retry::with_retry;
use crate::watcher::{ChangeEvent, WatcherEvent};
use crate::SyncError;

/// Result of draining one batch of watcher events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherOutcome {
    /// False when at least one event failed at the item level
    pub success: bool,
    /// Folders the crawl must reconcile to finish what the events started
    pub rescan: BTreeSet<RelativePath>,
}

/// Applies watcher events to the remote side
#[derive(Debug, Clone)]
pub struct IncrementalEngine {
    ctx: Arc<SyncContext>,
    ops: OperationsExecutor,
    correlator: PathCorrelator,
}

fn parent_of(path: &RelativePath) -> RelativePath {
    path.parent().unwrap_or_else(RelativePath::root)
}

impl IncrementalEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ops: OperationsExecutor::new(Arc::clone(&ctx)),
            correlator: PathCorrelator::new(Arc::clone(&ctx.store), Arc::clone(&ctx.roots)),
            ctx,
        }
    }

    /// Process `events` in order
    ///
    /// Deletions wait for their grace deadline and are then left to the
    /// crawl. In download-only mode local edits are never pushed, so only
    /// deletions (which the crawl restores) have an effect.
    #[tracing::instrument(skip_all, fields(folder = %self.ctx.repo.name, events = events.len()))]
    pub async fn watcher_sync(&self, events: Vec<WatcherEvent>) -> Result<WatcherOutcome, SyncError> {
        let mut outcome = WatcherOutcome {
            success: true,
            rescan: BTreeSet::new(),
        };

        for event in events {
            self.ctx.control.checkpoint().await?;
            trace!(change = ?event.change, "Processing watcher event");

            let step = match &event.change {
                ChangeEvent::Deleted(path) => {
                    if let Some(deadline) = event.grace_deadline {
                        self.ctx.control.sleep_until(deadline).await?;
                    }
                    if let Some(path) = self.relative(path) {
                        debug!(path = %path, "Local deletion, deferring to the crawl");
                        outcome.rescan.insert(parent_of(&path));
                    }
                    Ok(())
                }
                _ if !self.ctx.is_bidirectional() => Ok(()),
                ChangeEvent::Created(path) | ChangeEvent::Modified(path) => match self.relative(path) {
                    Some(path) => self.handle_change(&path, &mut outcome.rescan).await,
                    None => Ok(()),
                },
                ChangeEvent::Renamed { old, new } => match (self.relative(old), self.relative(new)) {
                    (Some(old), Some(new)) => self.handle_move(&old, &new, &mut outcome.rescan).await,
                    (None, Some(new)) => self.handle_change(&new, &mut outcome.rescan).await,
                    (Some(old), None) => {
                        outcome.rescan.insert(parent_of(&old));
                        Ok(())
                    }
                    (None, None) => Ok(()),
                },
            };
            outcome.success &= settle(step.map(|()| true))?;
        }

        Ok(outcome)
    }

    /// Path relative to the local root; `None` for the root itself and
    /// for anything outside it
    fn relative(&self, path: &Path) -> Option<RelativePath> {
        RelativePath::from_local(&self.ctx.roots.local_root, path)
            .ok()
            .filter(|p| !p.is_root())
    }

    async fn remote_entry(&self, item: &SyncItem) -> Result<Option<RemoteEntry>> {
        let remote = &self.ctx.remote;
        let path = item.remote_path();
        let path_ref = &path;
        with_retry(self.ctx.retry, "get_entry", || async move {
            remote.get_entry(path_ref).await
        })
        .await
    }

    /// The parent of `path` is either the root or a synchronized folder
    async fn parent_is_tracked(&self, path: &RelativePath) -> Result<bool> {
        let parent = parent_of(path);
        Ok(parent.is_root() || self.ctx.store.lookup(&parent).await?.is_some())
    }

    async fn handle_change(&self, path: &RelativePath, rescan: &mut BTreeSet<RelativePath>) -> Result<()> {
        if !self.ctx.filter.is_worth_syncing(path) {
            trace!(path = %path, "Filtered");
            return Ok(());
        }
        let is_folder = match local::kind_of(&path.to_local(&self.ctx.roots.local_root)).await? {
            None | Some(LocalKind::Other) => {
                trace!(path = %path, "Gone before it could be processed");
                return Ok(());
            }
            Some(kind) => kind == LocalKind::Folder,
        };
        if !self.parent_is_tracked(path).await? {
            debug!(path = %path, "Parent folder not synchronized yet");
            rescan.insert(parent_of(path));
            return Ok(());
        }

        let record = self.ctx.store.lookup(path).await?;
        let item = self.correlator.from_local(path.clone(), is_folder).await?;

        match (is_folder, record) {
            (true, Some(_)) => Ok(()),
            (true, None) => {
                if self.ops.create_remote_folder(&item).await?.is_some() {
                    rescan.insert(path.clone());
                }
                Ok(())
            }
            (false, None) => match self.remote_entry(&item).await? {
                None => self.ops.upload(&item).await,
                Some(_) => {
                    debug!(path = %item, "New file also exists remotely");
                    rescan.insert(parent_of(path));
                    Ok(())
                }
            },
            (false, Some(record)) => self.push_content(&item, &record, rescan).await,
        }
    }

    /// Update the remote content of a tracked file if it changed locally
    async fn push_content(
        &self,
        item: &SyncItem,
        record: &ChangeRecord,
        rescan: &mut BTreeSet<RelativePath>,
    ) -> Result<()> {
        let live = local::checksum_file(&item.local_path()).await?;
        if !record.is_dirty(&live) {
            trace!(path = %item, "Content unchanged");
            return Ok(());
        }
        match self.remote_entry(item).await? {
            Some(entry) if entry.is_document() && !record.is_remote_newer(entry.last_modified) => {
                self.ops.update_content(item, &entry).await
            }
            _ => {
                debug!(path = %item, "Remote side changed too, deferring to the crawl");
                rescan.insert(parent_of(item.local_relative()));
                Ok(())
            }
        }
    }

    async fn handle_move(
        &self,
        old: &RelativePath,
        new: &RelativePath,
        rescan: &mut BTreeSet<RelativePath>,
    ) -> Result<()> {
        let (old_parent, new_parent) = (parent_of(old), parent_of(new));

        if !self.ctx.filter.is_worth_syncing(new) {
            debug!(from = %old, to = %new, "Moved out of the synchronized set");
            rescan.insert(old_parent);
            return Ok(());
        }
        if !self.ctx.filter.is_worth_syncing(old) {
            return self.handle_change(new, rescan).await;
        }

        let is_folder = match local::kind_of(&new.to_local(&self.ctx.roots.local_root)).await? {
            None | Some(LocalKind::Other) => {
                rescan.insert(old_parent);
                rescan.insert(new_parent);
                return Ok(());
            }
            Some(kind) => kind == LocalKind::Folder,
        };
        let Some(record) = self.ctx.store.lookup(old).await? else {
            debug!(from = %old, to = %new, "Source never synchronized, treating as new");
            return self.handle_change(new, rescan).await;
        };
        // Something was installed under the old name after the rename, as
        // when a download sets the local copy aside; the record belongs to
        // the new occupant
        if local::kind_of(&old.to_local(&self.ctx.roots.local_root)).await?.is_some() {
            debug!(from = %old, to = %new, "Source name occupied again, treating as new");
            return self.handle_change(new, rescan).await;
        }
        let old_item = SyncItem::new(
            Arc::clone(&self.ctx.roots),
            record.local_path.clone(),
            record.remote_path.clone(),
            record.is_folder,
        );

        if self.ctx.store.lookup(new).await?.is_some() {
            info!(from = %old, to = %new, "Target already tracked, replacing instead of moving");
            self.ops.delete_remote(&old_item, &record).await?;
            return self.handle_change(new, rescan).await;
        }

        let renamed = old_parent == new_parent;
        let moved = !renamed && old.file_name() == new.file_name();
        if !renamed && !moved {
            debug!(from = %old, to = %new, "Neither a rename nor a move");
            rescan.insert(old_parent);
            rescan.insert(new_parent);
            return Ok(());
        }
        if moved && !self.parent_is_tracked(new).await? {
            debug!(from = %old, to = %new, "Destination folder not synchronized yet");
            rescan.insert(old_parent);
            rescan.insert(new_parent);
            return Ok(());
        }

        let new_item = self.correlator.from_local(new.clone(), is_folder).await?;
        if renamed {
            self.ops.rename_remote(&old_item, &new_item, &record).await?;
        } else {
            self.ops.move_remote(&old_item, &new_item, &record).await?;
        }

        // Edited during the move window
        if !is_folder {
            if let Some(record) = self.ctx.store.lookup(new).await? {
                self.push_content(&new_item, &record, rescan).await?;
            }
        }
        Ok(())
    }
}
