//! Full recursive reconciliation
//!
//! For one folder present on both sides, the crawl:
//!
//! 1. enumerates the remote children once and reconciles each of them
//!    against the local entry of the same (translated) name, descending
//!    into folders;
//! 2. walks the local files no remote child claimed, uploading new ones
//!    and deleting those that disappeared remotely;
//! 3. does the same for local folders.
//!
//! When the session can list whole subtrees, the first listing of a crawl
//! fetches everything below the folder at once and later folders are served
//! from that snapshot.
//!
//! Per-object failures are logged and reported as `Ok(false)`; the crawl
//! keeps going. Cancellation, systemic and fatal failures end it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use docsync_conflict::{ConflictDetector, Divergence};
use docsync_core::domain::{
    ChangeRecord, RecordUpdate, RelativePath, RemoteEntry, RemoteKind, RemotePath, SyncItem,
};

use crate::context::SyncContext;
use crate::correlator::PathCorrelator;
use crate::failure::{escalate, settle};
use crate::local::{self, LocalEntry, LocalKind};
use crate::operations::OperationsExecutor;
use crate::retry::with_retry;
use crate::SyncError;

type CrawlFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, SyncError>> + Send + 'a>>;

/// Remote children per folder, taken from a subtree listing
type Listing = HashMap<RemotePath, Vec<RemoteEntry>>;

/// Recursive two-sided reconciliation
#[derive(Debug, Clone)]
pub struct CrawlEngine {
    ctx: Arc<SyncContext>,
    ops: OperationsExecutor,
    correlator: PathCorrelator,
    prefetched: Arc<Mutex<Listing>>,
}

impl CrawlEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ops: OperationsExecutor::new(Arc::clone(&ctx)),
            correlator: PathCorrelator::new(Arc::clone(&ctx.store), Arc::clone(&ctx.roots)),
            prefetched: Arc::default(),
            ctx,
        }
    }

    /// Crawl the whole folder pair
    #[tracing::instrument(skip(self), fields(folder = %self.ctx.repo.name))]
    pub async fn crawl_root(&self) -> Result<bool, SyncError> {
        self.prefetched().clear();
        let root = SyncItem::root(Arc::clone(&self.ctx.roots));
        self.crawl_sync(&root).await
    }

    /// Reconcile `folder`, which exists on both sides, and everything below it
    pub fn crawl_sync<'a>(&'a self, folder: &'a SyncItem) -> CrawlFuture<'a> {
        Box::pin(async move {
            self.ctx.control.checkpoint().await?;
            debug!(folder = %folder, "Crawling folder");

            let remote_children = match self.list_remote(folder).await {
                Ok(children) => children,
                Err(err) => {
                    escalate(err)?;
                    return Ok(false);
                }
            };
            let local_entries = match local::list_dir(&folder.local_path()).await {
                Ok(entries) => entries,
                Err(err) => {
                    escalate(err)?;
                    return Ok(false);
                }
            };

            let mut ok = true;
            let mut seen = HashSet::new();
            let mut claimed = HashSet::new();

            for entry in &remote_children {
                self.ctx.control.checkpoint().await?;

                if !seen.insert(self.ctx.name_key(&entry.name)) {
                    warn!(folder = %folder, name = %entry.name, "Duplicate remote name, skipping");
                    continue;
                }
                let child = match self.remote_child(folder, entry).await {
                    Ok(child) => child,
                    Err(err) => {
                        escalate(err)?;
                        ok = false;
                        continue;
                    }
                };
                claimed.insert(child.local_name().to_string());

                if !self.is_worth_syncing(&child) {
                    trace!(path = %child, "Filtered");
                    continue;
                }

                let step = match &entry.kind {
                    RemoteKind::Unsupported(reason) => {
                        debug!(path = %child, reason = %reason, "Unsupported remote object, skipping");
                        continue;
                    }
                    RemoteKind::Folder => self.reconcile_remote_folder(&child, entry).await,
                    RemoteKind::Document { .. } => self
                        .reconcile_remote_document(&child, entry)
                        .await
                        .map(|()| true),
                };
                ok &= settle(step)?;
            }

            let (files, folders): (Vec<LocalEntry>, Vec<LocalEntry>) = local_entries
                .into_iter()
                .filter(|e| e.kind != LocalKind::Other && !claimed.contains(&e.name))
                .partition(LocalEntry::is_file);

            for entry in files.iter().chain(folders.iter()) {
                self.ctx.control.checkpoint().await?;

                if seen.contains(&self.ctx.name_key(&entry.name)) {
                    debug!(folder = %folder, name = %entry.name, "Local name differs from a remote one only by case, skipping");
                    continue;
                }
                let step = self.reconcile_local_entry(folder, entry).await;
                ok &= settle(step)?;
            }

            Ok(ok)
        })
    }

    /// Crawl each folder of `scope` (local relative paths)
    ///
    /// Every entry is widened to its closest ancestor that exists and is
    /// tracked on both sides; entries below another entry are crawled once.
    pub async fn crawl_scope(&self, scope: &BTreeSet<RelativePath>) -> Result<bool, SyncError> {
        self.prefetched().clear();
        let mut ok = true;
        let mut targets: Vec<SyncItem> = Vec::new();

        for path in scope {
            self.ctx.control.checkpoint().await?;
            match self.scope_folder(path).await {
                Ok(item) => targets.push(item),
                Err(err) => {
                    escalate(err)?;
                    ok = false;
                }
            }
        }

        targets.sort_by(|a, b| a.local_relative().cmp(b.local_relative()));
        let mut crawled: Vec<RelativePath> = Vec::new();
        for folder in &targets {
            if crawled.iter().any(|c| folder.local_relative().starts_with(c)) {
                continue;
            }
            info!(folder = %folder, "Scoped crawl");
            ok &= self.crawl_sync(folder).await?;
            crawled.push(folder.local_relative().clone());
        }
        Ok(ok)
    }

    async fn scope_folder(&self, path: &RelativePath) -> Result<SyncItem> {
        let mut candidate = Some(path.clone());
        while let Some(current) = candidate {
            if current.is_root() {
                break;
            }
            if self.ctx.store.lookup(&current).await?.is_some_and(|r| r.is_folder) {
                let item = self.correlator.from_local(current.clone(), true).await?;
                if local::is_dir(&item.local_path()).await && self.remote_is_folder(&item).await? {
                    return Ok(item);
                }
            }
            candidate = current.parent();
        }
        Ok(SyncItem::root(Arc::clone(&self.ctx.roots)))
    }

    // ------------------------------------------------------------------
    // Remote side
    // ------------------------------------------------------------------

    async fn list_remote(&self, folder: &SyncItem) -> Result<Vec<RemoteEntry>> {
        let path = folder.remote_path();
        if !self.ctx.capabilities.descendants {
            let remote = &self.ctx.remote;
            let path_ref = &path;
            return with_retry(self.ctx.retry, "get_children", || async move {
                remote.get_children(path_ref).await
            })
            .await;
        }

        let cached = self.prefetched().remove(&path);
        if let Some(children) = cached {
            return Ok(children);
        }
        let mut listing = self.fetch_subtree(&path).await?;
        let children = listing.remove(&path).unwrap_or_default();
        self.prefetched().extend(listing);
        Ok(children)
    }

    /// One subtree listing, grouped by parent folder
    ///
    /// Every folder of the subtree gets an entry, empty ones included, so
    /// that descending into it never goes back to the server.
    async fn fetch_subtree(&self, folder: &RemotePath) -> Result<Listing> {
        let remote = &self.ctx.remote;
        let descendants = with_retry(self.ctx.retry, "get_descendants", || async move {
            remote.get_descendants(folder).await
        })
        .await?;
        debug!(folder = %folder, objects = descendants.len(), "Fetched remote subtree");

        let mut listing = Listing::new();
        listing.insert(folder.clone(), Vec::new());
        for descendant in descendants {
            // Unusable names are reported when the crawl reaches them
            if let (true, Ok(path)) = (
                descendant.entry.is_folder(),
                descendant.parent.join(&descendant.entry.name),
            ) {
                listing.entry(path).or_default();
            }
            listing.entry(descendant.parent).or_default().push(descendant.entry);
        }
        Ok(listing)
    }

    fn prefetched(&self) -> MutexGuard<'_, Listing> {
        self.prefetched.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn remote_is_folder(&self, item: &SyncItem) -> Result<bool> {
        let remote = &self.ctx.remote;
        let path = item.remote_path();
        let path_ref = &path;
        let entry = with_retry(self.ctx.retry, "get_entry", || async move {
            remote.get_entry(path_ref).await
        })
        .await?;
        Ok(entry.is_some_and(|e| e.is_folder()))
    }

    async fn remote_child(&self, folder: &SyncItem, entry: &RemoteEntry) -> Result<SyncItem> {
        let path = folder.remote_relative().join(&entry.name)?;
        self.correlator.from_remote(path, entry.is_folder()).await
    }

    fn is_worth_syncing(&self, item: &SyncItem) -> bool {
        let filter = &self.ctx.filter;
        filter.is_worth_syncing(item.local_relative()) && filter.is_worth_syncing(item.remote_relative())
    }

    async fn reconcile_remote_folder(&self, child: &SyncItem, entry: &RemoteEntry) -> Result<bool> {
        let record = self.ctx.store.lookup(child.local_relative()).await?;

        match local::kind_of(&child.local_path()).await? {
            Some(LocalKind::Folder) => {
                if record.as_ref().map_or(true, |r| r.remote_id != entry.id) {
                    let adopted = RecordUpdate::new(entry.id.clone(), entry.last_modified).into_record(child);
                    self.ctx.store.upsert(&adopted).await?;
                }
                Ok(self.crawl_sync(child).await?)
            }
            Some(LocalKind::Other) => {
                debug!(path = %child, "Local entry is neither file nor folder, skipping");
                Ok(true)
            }
            Some(LocalKind::File) => {
                // A local file occupies the name of a remote folder
                if !self.ops.create_local_folder(child, entry).await? {
                    return Ok(true);
                }
                Ok(self.crawl_sync(child).await?)
            }
            None => match record {
                Some(record) if self.ctx.is_bidirectional() => {
                    info!(path = %child, "Folder removed locally, deleting remotely");
                    self.ops.delete_remote(child, &record).await?;
                    Ok(true)
                }
                _ => {
                    if !self.ops.create_local_folder(child, entry).await? {
                        return Ok(true);
                    }
                    Ok(self.crawl_sync(child).await?)
                }
            },
        }
    }

    async fn reconcile_remote_document(&self, child: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        let path = child.local_path();
        let record = self.ctx.store.lookup(child.local_relative()).await?;

        match local::kind_of(&path).await? {
            None => match &record {
                Some(r) if !r.is_remote_newer(entry.last_modified) && self.ctx.is_bidirectional() => {
                    info!(path = %child, "Document removed locally, deleting remotely");
                    self.ops.delete_remote(child, r).await
                }
                _ => self.ops.download(child, entry).await,
            },
            Some(LocalKind::Other) => Ok(()),
            // A local folder occupies the name of a remote document; the
            // download sets the folder aside
            Some(LocalKind::Folder) => self.ops.download(child, entry).await,
            Some(LocalKind::File) => {
                let live = local::checksum_file(&path).await?;
                match ConflictDetector::classify(record.as_ref(), entry.last_modified, Some(&live)) {
                    Divergence::InSync => self.refresh_identity(record, entry).await,
                    Divergence::LocalChanged => {
                        if self.ctx.is_bidirectional() {
                            self.ops.update_content(child, entry).await
                        } else {
                            Ok(())
                        }
                    }
                    Divergence::FirstContact | Divergence::RemoteChanged | Divergence::Conflict => {
                        self.ops.download(child, entry).await
                    }
                }
            }
        }
    }

    /// Keep the record pointing at the current remote object
    async fn refresh_identity(&self, record: Option<ChangeRecord>, entry: &RemoteEntry) -> Result<()> {
        if let Some(mut record) = record {
            if record.remote_id != entry.id {
                debug!(path = %record.local_path, "Remote object replaced, updating id");
                record.remote_id = entry.id.clone();
                self.ctx.store.upsert(&record).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local side
    // ------------------------------------------------------------------

    async fn reconcile_local_entry(&self, folder: &SyncItem, entry: &LocalEntry) -> Result<bool> {
        let path = folder.local_relative().join(&entry.name)?;
        if !self.ctx.filter.is_worth_syncing(&path) {
            trace!(path = %path, "Filtered");
            return Ok(true);
        }
        let child = self.correlator.from_local(path, entry.is_folder()).await?;
        if entry.is_folder() {
            self.reconcile_local_folder(&child).await
        } else {
            self.reconcile_local_file(&child).await.map(|()| true)
        }
    }

    async fn reconcile_local_file(&self, child: &SyncItem) -> Result<()> {
        let store = &self.ctx.store;
        match store.lookup(child.local_relative()).await? {
            Some(record) => {
                if self.ctx.is_bidirectional() {
                    let live = local::checksum_file(&child.local_path()).await?;
                    if record.is_dirty(&live) {
                        info!(path = %child, "Locally modified file was deleted remotely, uploading it again");
                        store.remove(child.local_relative()).await?;
                        return self.ops.upload(child).await;
                    }
                }
                info!(path = %child, "File deleted remotely, deleting locally");
                self.ops.delete_local(child).await
            }
            None if self.ctx.is_bidirectional() => self.ops.upload(child).await,
            None => Ok(()),
        }
    }

    async fn reconcile_local_folder(&self, child: &SyncItem) -> Result<bool> {
        let store = &self.ctx.store;
        match store.lookup(child.local_relative()).await? {
            Some(_) => {
                if self.ctx.is_bidirectional() && self.has_unsynced_content(child).await? {
                    info!(path = %child, "Remotely deleted folder holds local changes, uploading it again");
                    store.remove_tree(child.local_relative()).await?;
                    return self.upload_folder(child).await;
                }
                info!(path = %child, "Folder deleted remotely, deleting locally");
                self.ops.delete_local(child).await?;
                Ok(true)
            }
            None if self.ctx.is_bidirectional() => self.upload_folder(child).await,
            None => Ok(true),
        }
    }

    async fn upload_folder(&self, child: &SyncItem) -> Result<bool> {
        match self.ops.create_remote_folder(child).await? {
            Some(_) => Ok(self.crawl_sync(child).await?),
            None => Ok(true),
        }
    }

    /// True when the local subtree of `folder` holds untracked or modified files
    async fn has_unsynced_content(&self, folder: &SyncItem) -> Result<bool> {
        let records: HashMap<RelativePath, ChangeRecord> = self
            .ctx
            .store
            .list_tree(folder.local_relative())
            .await?
            .into_iter()
            .map(|r| (r.local_path.clone(), r))
            .collect();
        let root = &self.ctx.roots.local_root;

        let mut pending = vec![folder.local_relative().clone()];
        while let Some(dir) = pending.pop() {
            for entry in local::list_dir(&dir.to_local(root)).await? {
                let path = dir.join(&entry.name)?;
                if !self.ctx.filter.is_worth_syncing(&path) {
                    continue;
                }
                match entry.kind {
                    LocalKind::Folder => {
                        if !records.contains_key(&path) {
                            return Ok(true);
                        }
                        pending.push(path);
                    }
                    LocalKind::File => match records.get(&path) {
                        None => return Ok(true),
                        Some(record) => {
                            let live = local::checksum_file(&path.to_local(root)).await?;
                            if record.is_dirty(&live) {
                                return Ok(true);
                            }
                        }
                    },
                    LocalKind::Other => {}
                }
            }
        }
        Ok(false)
    }
}
