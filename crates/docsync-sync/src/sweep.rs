//! Local sweep: pushes local-only changes found by walking the tree
//!
//! Used on the first sync (before the crawl, so pre-existing local work is
//! sent before remote content can overwrite it) and on incremental passes
//! to catch changes made while no watcher was running.
//!
//! The sweep never resolves conflicts itself. Whenever the remote side
//! changed too, or an object of the same name already exists remotely,
//! the item is left for the crawl.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use docsync_core::domain::{RecordUpdate, RelativePath, RemoteEntry, SyncItem};

use crate::context::SyncContext;
use crate::correlator::PathCorrelator;
use crate::failure::settle;
use crate::local::{self, LocalKind};
use crate::operations::OperationsExecutor;
use crate::retry::with_retry;
use crate::SyncError;

/// Walks the local tree and the change store looking for local-only changes
#[derive(Debug, Clone)]
pub struct LocalSweep {
    ctx: Arc<SyncContext>,
    ops: OperationsExecutor,
    correlator: PathCorrelator,
}

impl LocalSweep {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ops: OperationsExecutor::new(Arc::clone(&ctx)),
            correlator: PathCorrelator::new(Arc::clone(&ctx.store), Arc::clone(&ctx.roots)),
            ctx,
        }
    }

    /// Push new, modified and deleted local items
    ///
    /// A download-only folder pair never pushes anything, so the sweep is a
    /// no-op there.
    #[tracing::instrument(skip(self), fields(folder = %self.ctx.repo.name))]
    pub async fn sweep(&self) -> Result<bool, SyncError> {
        if !self.ctx.is_bidirectional() {
            return Ok(true);
        }
        let mut ok = self.push_new_and_modified().await?;
        ok &= self.push_deletions().await?;
        Ok(ok)
    }

    async fn push_new_and_modified(&self) -> Result<bool, SyncError> {
        let root = &self.ctx.roots.local_root;
        let mut ok = true;
        let mut pending = vec![RelativePath::root()];

        while let Some(dir) = pending.pop() {
            self.ctx.control.checkpoint().await?;
            let entries = match local::list_dir(&dir.to_local(root)).await {
                Ok(entries) => entries,
                Err(err) => {
                    ok &= settle(Err(err))?;
                    continue;
                }
            };

            for entry in entries {
                self.ctx.control.checkpoint().await?;
                let path = match dir.join(&entry.name) {
                    Ok(path) => path,
                    Err(err) => {
                        ok &= settle(Err(err.into()))?;
                        continue;
                    }
                };
                if !self.ctx.filter.is_worth_syncing(&path) {
                    continue;
                }
                match entry.kind {
                    LocalKind::Folder => {
                        match self.sweep_folder(&path).await {
                            Ok(true) => pending.push(path),
                            Ok(false) => {}
                            Err(err) => ok &= settle(Err(err))?,
                        }
                    }
                    LocalKind::File => ok &= settle(self.sweep_file(&path).await.map(|()| true))?,
                    LocalKind::Other => {}
                }
            }
        }
        Ok(ok)
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

    /// Returns whether the folder exists remotely (so its content can be swept)
    async fn sweep_folder(&self, path: &RelativePath) -> Result<bool> {
        if self.ctx.store.lookup(path).await?.is_some() {
            return Ok(true);
        }
        let item = self.correlator.from_local(path.clone(), true).await?;
        match self.remote_entry(&item).await? {
            None => Ok(self.ops.create_remote_folder(&item).await?.is_some()),
            Some(entry) if entry.is_folder() => {
                debug!(path = %item, "Folder exists on both sides, adopting");
                let record = RecordUpdate::new(entry.id, entry.last_modified).into_record(&item);
                self.ctx.store.upsert(&record).await?;
                Ok(true)
            }
            Some(_) => {
                debug!(path = %item, "Name taken by a remote document, left to the crawl");
                Ok(false)
            }
        }
    }

    async fn sweep_file(&self, path: &RelativePath) -> Result<()> {
        let record = self.ctx.store.lookup(path).await?;
        let item = self.correlator.from_local(path.clone(), false).await?;

        let Some(record) = record else {
            return match self.remote_entry(&item).await? {
                None => self.ops.upload(&item).await,
                Some(_) => {
                    debug!(path = %item, "Untracked file also exists remotely, left to the crawl");
                    Ok(())
                }
            };
        };

        let live = local::checksum_file(&item.local_path()).await?;
        if !record.is_dirty(&live) {
            return Ok(());
        }
        match self.remote_entry(&item).await? {
            Some(entry) if entry.is_document() && !record.is_remote_newer(entry.last_modified) => {
                self.ops.update_content(&item, &entry).await
            }
            _ => {
                debug!(path = %item, "Modified file changed remotely too, left to the crawl");
                Ok(())
            }
        }
    }

    /// Delete remotely what was synchronized and is now missing locally
    async fn push_deletions(&self) -> Result<bool, SyncError> {
        let records = match self.ctx.store.list_tree(&RelativePath::root()).await {
            Ok(records) => records,
            Err(err) => return settle(Err(err)),
        };

        let mut ok = true;
        let mut handled: Vec<RelativePath> = Vec::new();
        for record in records {
            self.ctx.control.checkpoint().await?;
            if record.local_path.is_root()
                || handled.iter().any(|h| record.local_path.starts_with(h))
                || !self.ctx.filter.is_worth_syncing(&record.local_path)
            {
                continue;
            }

            let local_path = record.local_path.to_local(&self.ctx.roots.local_root);
            match local::kind_of(&local_path).await {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(err) => {
                    ok &= settle(Err(err))?;
                    continue;
                }
            }
            handled.push(record.local_path.clone());

            let step = async {
                let item = SyncItem::new(
                    Arc::clone(&self.ctx.roots),
                    record.local_path.clone(),
                    record.remote_path.clone(),
                    record.is_folder,
                );
                match self.remote_entry(&item).await? {
                    None => {
                        debug!(path = %item, "Gone on both sides, forgetting");
                        self.ctx.store.remove_tree(&record.local_path).await?;
                    }
                    Some(entry) if entry.is_document() && record.is_remote_newer(entry.last_modified) => {
                        debug!(path = %item, "Deleted locally but changed remotely, left to the crawl");
                    }
                    Some(_) => {
                        info!(path = %item, "Deleted locally, deleting remotely");
                        self.ops.delete_remote(&item, &record).await?;
                    }
                }
                Ok::<_, anyhow::Error>(true)
            };
            ok &= settle(step.await)?;
        }
        Ok(ok)
    }
}
