//! Local/remote path correlation
//!
//! Local and remote names of the same item may differ (an item renamed on
//! one side keeps its record under the translated name). The correlator
//! completes a [`PartialItem`] by finding the closest ancestor with a
//! change record and re-applying the remaining components unchanged:
//!
//! ```text
//!   local  "Reports/2024/q1.odt"
//!           └─ record for "Reports" → remote "Berichte"
//!   remote "Berichte/2024/q1.odt"
//! ```
//!
//! Without any recorded ancestor both sides share the same relative path.

use std::sync::Arc;

use anyhow::Result;
use tracing::trace;

use docsync_core::domain::{
    ChangeRecord, FolderRoots, PartialItem, PathOrigin, RelativePath, SyncItem,
};
use docsync_core::ports::IChangeStore;

/// Translates paths between the two sides of one folder pair
#[derive(Clone)]
pub struct PathCorrelator {
    store: Arc<dyn IChangeStore>,
    roots: Arc<FolderRoots>,
}

impl PathCorrelator {
    pub fn new(store: Arc<dyn IChangeStore>, roots: Arc<FolderRoots>) -> Self {
        Self { store, roots }
    }

    pub fn roots(&self) -> &Arc<FolderRoots> {
        &self.roots
    }

    /// Complete `partial` with the path of the other side
    pub async fn resolve(&self, partial: PartialItem) -> Result<SyncItem> {
        let other = match partial.origin() {
            PathOrigin::Local(path) => self.remote_of(path).await?,
            PathOrigin::Remote(path) => self.local_of(path).await?,
        };
        Ok(partial.resolve(other))
    }

    /// Item first seen locally
    pub async fn from_local(&self, path: RelativePath, is_folder: bool) -> Result<SyncItem> {
        self.resolve(PartialItem::local(Arc::clone(&self.roots), path, is_folder))
            .await
    }

    /// Item first seen remotely
    pub async fn from_remote(&self, path: RelativePath, is_folder: bool) -> Result<SyncItem> {
        self.resolve(PartialItem::remote(Arc::clone(&self.roots), path, is_folder))
            .await
    }

    /// Remote relative path of a local relative path
    pub async fn remote_of(&self, local: &RelativePath) -> Result<RelativePath> {
        let store = &self.store;
        translate(local, |p| async move { store.lookup(&p).await }, |r| {
            (r.local_path.clone(), r.remote_path.clone())
        })
        .await
    }

    /// Local relative path of a remote relative path
    pub async fn local_of(&self, remote: &RelativePath) -> Result<RelativePath> {
        let store = &self.store;
        translate(
            remote,
            |p| async move { store.lookup_by_remote_path(&p).await },
            |r| (r.remote_path.clone(), r.local_path.clone()),
        )
        .await
    }
}

impl std::fmt::Debug for PathCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCorrelator")
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

/// Walk up from `path` until `lookup` finds a record, then rebase
///
/// `sides` maps a record to (this side's path, other side's path).
async fn translate<L, Fut, S>(path: &RelativePath, lookup: L, sides: S) -> Result<RelativePath>
where
    L: Fn(RelativePath) -> Fut,
    Fut: std::future::Future<Output = Result<Option<ChangeRecord>>>,
    S: Fn(&ChangeRecord) -> (RelativePath, RelativePath),
{
    let mut current = Some(path.clone());
    while let Some(ancestor) = current {
        if ancestor.is_root() {
            break;
        }
        if let Some(record) = lookup(ancestor.clone()).await? {
            let (from, to) = sides(&record);
            if let Some(translated) = path.rebase(&from, &to) {
                trace!(path = %path, via = %from, translated = %translated, "Translated through record");
                return Ok(translated);
            }
        }
        current = ancestor.parent();
    }
    Ok(path.clone())
}
