//! Primitive synchronization operations
//!
//! Every operation acts on one [`SyncItem`], talks to the remote through
//! [`with_retry`], and writes the resulting state to the change store only
//! after the operation has fully succeeded.
//!
//! Operations run through [`OperationsExecutor::guarded`], which enforces
//! the per-path retry counters: once an item has failed `max_*_retries`
//! times for an operation kind it is skipped (and treated as handled) until
//! the counter is reset by a success or a move.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info, instrument, warn};

use docsync_conflict::{checked_out_notice, conflict_notice, ConflictNamer};
use docsync_core::domain::{
    ChangeRecord, OperationKind, RecordUpdate, RelativePath, RemoteEntry, RemoteKind, SyncItem,
};
use docsync_core::ports::RemoteError;

use crate::context::SyncContext;
use crate::failure::{classify, remote_error, Failure};
use crate::filter::SyncFilter;
use crate::local::{self, LocalKind};
use crate::retry::with_retry;
use crate::SyncError;

/// Executes transfers and bookkeeping for one pass
#[derive(Debug, Clone)]
pub struct OperationsExecutor {
    ctx: Arc<SyncContext>,
}

impl OperationsExecutor {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Fails with [`SyncError::Fatal`] when the local root has disappeared
    ///
    /// Checked before anything that could destroy data, so an unmounted
    /// drive is never mistaken for a mass deletion.
    pub async fn ensure_root(&self) -> Result<()> {
        let root = &self.ctx.roots.local_root;
        if local::is_dir(root).await {
            Ok(())
        } else {
            Err(SyncError::Fatal(format!("Local root {} is missing", root.display())).into())
        }
    }

    /// Run `op` under the retry counter of (`path`, `kind`)
    ///
    /// Returns `Ok(None)` without running `op` when the counter is exhausted.
    /// A failure increments the counter unless it is systemic or the
    /// document is checked out by someone else (the user is notified
    /// instead).
    pub async fn guarded<T, F>(&self, kind: OperationKind, path: &RelativePath, op: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        let store = &self.ctx.store;
        let max = self.ctx.max_retries(kind);
        let count = store.retry_count(path, kind).await?;
        if count >= max {
            debug!(path = %path, operation = %kind, count, "Retry limit reached, skipping");
            return Ok(None);
        }

        match op.await {
            Ok(value) => {
                if count > 0 {
                    store.reset_retry(path, kind).await?;
                }
                Ok(Some(value))
            }
            Err(err) => {
                if let Some(RemoteError::CheckedOut { by }) = remote_error(&err) {
                    self.ctx
                        .notifier
                        .notify(&checked_out_notice(path.as_str(), by))
                        .await?;
                } else if classify(&err) == Failure::Item {
                    let attempts = store.increment_retry(path, kind).await?;
                    warn!(
                        path = %path,
                        operation = %kind,
                        attempts,
                        max,
                        error = %format!("{err:#}"),
                        "Operation failed"
                    );
                }
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Install the remote content of `entry` at `item`
    #[instrument(skip_all, fields(path = %item))]
    pub async fn download(&self, item: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        if !SyncFilter::is_valid_local_name(item.local_name()) {
            warn!(name = item.local_name(), "Remote name cannot be used locally, skipping");
            return Ok(());
        }
        self.guarded(
            OperationKind::Download,
            item.local_relative(),
            self.download_inner(item, entry),
        )
        .await
        .map(drop)
    }

    async fn download_inner(&self, item: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        self.ensure_root().await?;

        let target = item.local_path();
        let tmp = local::temp_path(&target);
        let remote = &self.ctx.remote;
        let id = &entry.id;
        let tmp_ref = &tmp;
        let streamed = with_retry(self.ctx.retry, "download", || async move {
            let content = remote.get_content(id).await?;
            local::write_stream(content, tmp_ref).await
        })
        .await;
        let (checksum, size) = match streamed {
            Ok(done) => done,
            Err(err) => {
                if let Err(cleanup) = local::remove(&tmp).await {
                    warn!(error = %cleanup, "Cannot remove partial download");
                }
                return Err(err);
            }
        };

        // Whatever sits at the target is about to be replaced
        match local::kind_of(&target).await? {
            None => {}
            Some(LocalKind::File) => {
                let live = local::checksum_file(&target).await?;
                let record = self.ctx.store.lookup(item.local_relative()).await?;
                let unsynced = record.as_ref().map_or(true, |r| r.is_dirty(&live));
                if live != checksum && unsynced {
                    self.backup_local(item).await?;
                }
            }
            Some(_) => {
                self.backup_local(item).await?;
            }
        }

        local::install(&tmp, &target).await?;
        local::set_modified(&target, entry.last_modified).await?;
        local::set_read_only(&target, entry.is_read_only()).await?;

        let record = RecordUpdate::new(entry.id.clone(), entry.last_modified)
            .with_checksum(checksum)
            .with_metadata("size", size.to_string())
            .into_record(item);
        self.ctx.store.upsert(&record).await?;

        info!(bytes = size, "Downloaded");
        Ok(())
    }

    /// Create the local counterpart of a remote folder
    ///
    /// Returns false when the folder was skipped.
    #[instrument(skip_all, fields(path = %item))]
    pub async fn create_local_folder(&self, item: &SyncItem, entry: &RemoteEntry) -> Result<bool> {
        if !SyncFilter::is_valid_local_name(item.local_name()) {
            warn!(name = item.local_name(), "Remote name cannot be used locally, skipping");
            return Ok(false);
        }
        let created = self
            .guarded(OperationKind::Download, item.local_relative(), async {
                self.ensure_root().await?;
                let path = item.local_path();
                match local::kind_of(&path).await? {
                    Some(LocalKind::Folder) => {}
                    Some(_) => {
                        self.backup_local(item).await?;
                        tokio::fs::create_dir(&path).await?;
                    }
                    None => tokio::fs::create_dir(&path).await?,
                }
                let record = RecordUpdate::new(entry.id.clone(), entry.last_modified).into_record(item);
                self.ctx.store.upsert(&record).await?;
                info!("Created local folder");
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(created.is_some())
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Create `item` remotely (a document or a folder)
    #[instrument(skip_all, fields(path = %item))]
    pub async fn upload(&self, item: &SyncItem) -> Result<()> {
        if item.is_folder() {
            return self.create_remote_folder(item).await.map(drop);
        }
        self.guarded(OperationKind::Upload, item.local_relative(), self.upload_inner(item))
            .await
            .map(drop)
    }

    async fn upload_inner(&self, item: &SyncItem) -> Result<()> {
        let path = item.local_path();
        let parent = item
            .remote_path()
            .parent()
            .ok_or_else(|| anyhow!("{item} has no remote parent"))?;
        let checksum = local::checksum_file(&path).await?;
        let metadata = local::document_metadata(&path).await?;

        let remote = &self.ctx.remote;
        let (path_ref, parent_ref, meta_ref) = (&path, &parent, &metadata);
        let name = item.remote_name();
        let entry = with_retry(self.ctx.retry, "upload", || async move {
            let content = local::open(path_ref).await?;
            remote
                .create_document(parent_ref, name, content, meta_ref)
                .await
        })
        .await?;

        let record = RecordUpdate::new(entry.id, entry.last_modified)
            .with_checksum(checksum)
            .with_metadata("size", metadata.size.to_string())
            .into_record(item);
        self.ctx.store.upsert(&record).await?;

        info!(bytes = metadata.size, "Uploaded");
        Ok(())
    }

    /// Replace the content of the remote document `entry` with the local file
    #[instrument(skip_all, fields(path = %item))]
    pub async fn update_content(&self, item: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        self.guarded(
            OperationKind::Upload,
            item.local_relative(),
            self.update_inner(item, entry),
        )
        .await
        .map(drop)
    }

    async fn update_inner(&self, item: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        if let RemoteKind::Document {
            checked_out_by: Some(by),
            ..
        } = &entry.kind
        {
            if *by != self.ctx.repo.user {
                return Err(RemoteError::CheckedOut { by: by.clone() }.into());
            }
        }
        if entry.is_read_only() {
            return Err(RemoteError::PermissionDenied(format!(
                "{} is read-only on the server",
                item.remote_path()
            ))
            .into());
        }

        let path = item.local_path();
        let checksum = local::checksum_file(&path).await?;
        let metadata = local::document_metadata(&path).await?;

        let remote = &self.ctx.remote;
        let (path_ref, meta_ref, id) = (&path, &metadata, &entry.id);
        let updated = with_retry(self.ctx.retry, "update_content", || async move {
            let content = local::open(path_ref).await?;
            remote.set_content(id, content, meta_ref).await
        })
        .await?;

        let record = RecordUpdate::new(updated.id, updated.last_modified)
            .with_checksum(checksum)
            .with_metadata("size", metadata.size.to_string())
            .into_record(item);
        self.ctx.store.upsert(&record).await?;

        info!(bytes = metadata.size, "Updated remote content");
        Ok(())
    }

    /// Create the remote counterpart of a local folder
    ///
    /// An existing remote folder of the same name is adopted. Returns `None`
    /// when the operation was skipped.
    #[instrument(skip_all, fields(path = %item))]
    pub async fn create_remote_folder(&self, item: &SyncItem) -> Result<Option<RemoteEntry>> {
        self.guarded(OperationKind::Upload, item.local_relative(), async {
            let target = item.remote_path();
            let parent = target
                .parent()
                .ok_or_else(|| anyhow!("{item} has no remote parent"))?;
            let remote = &self.ctx.remote;
            let target_ref = &target;

            let existing = with_retry(self.ctx.retry, "get_entry", || async move {
                remote.get_entry(target_ref).await
            })
            .await?;

            let entry = match existing {
                Some(entry) if entry.is_folder() => {
                    debug!("Adopting existing remote folder");
                    entry
                }
                Some(_) => {
                    return Err(RemoteError::Constraint(format!(
                        "{target} exists and is not a folder"
                    ))
                    .into())
                }
                None => {
                    let (parent_ref, name) = (&parent, item.remote_name());
                    with_retry(self.ctx.retry, "create_folder", || async move {
                        remote.create_folder(parent_ref, name).await
                    })
                    .await?
                }
            };

            let record = RecordUpdate::new(entry.id.clone(), entry.last_modified).into_record(item);
            self.ctx.store.upsert(&record).await?;
            info!("Created remote folder");
            Ok::<_, anyhow::Error>(entry)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Deletions
    // ------------------------------------------------------------------

    /// Delete the remote object tracked by `record` (recursively for folders)
    ///
    /// A refusal by permission restores the item locally from the remote.
    #[instrument(skip_all, fields(path = %item))]
    pub async fn delete_remote(&self, item: &SyncItem, record: &ChangeRecord) -> Result<()> {
        self.guarded(OperationKind::Delete, item.local_relative(), async {
            self.ensure_root().await?;

            let remote = &self.ctx.remote;
            let (id, recursive) = (&record.remote_id, record.is_folder);
            let deleted = with_retry(self.ctx.retry, "delete", || async move {
                remote.delete(id, recursive).await
            })
            .await;

            if let Err(err) = deleted {
                match remote_error(&err) {
                    Some(RemoteError::NotFound(_)) => debug!("Already gone remotely"),
                    Some(RemoteError::PermissionDenied(_)) => {
                        warn!("Remote delete refused, restoring local copy");
                        self.ctx.store.remove_tree(item.local_relative()).await?;
                        return self.restore(item).await;
                    }
                    _ => return Err(err),
                }
            }

            self.ctx.store.remove_tree(item.local_relative()).await?;
            info!(recursive, "Deleted remotely");
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map(drop)
    }

    /// Bring back a local item whose remote deletion was refused
    async fn restore(&self, item: &SyncItem) -> Result<()> {
        let target = item.remote_path();
        let remote = &self.ctx.remote;
        let target_ref = &target;
        let entry = with_retry(self.ctx.retry, "get_entry", || async move {
            remote.get_entry(target_ref).await
        })
        .await?;

        match entry {
            Some(entry) if entry.is_document() => self.download_inner(item, &entry).await,
            Some(entry) if entry.is_folder() => {
                tokio::fs::create_dir_all(item.local_path()).await?;
                let record = RecordUpdate::new(entry.id.clone(), entry.last_modified).into_record(item);
                self.ctx.store.upsert(&record).await?;
                info!("Restored local folder; contents follow on the next crawl");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Delete `item` locally along with its records
    #[instrument(skip_all, fields(path = %item))]
    pub async fn delete_local(&self, item: &SyncItem) -> Result<()> {
        self.guarded(OperationKind::Delete, item.local_relative(), async {
            self.ensure_root().await?;
            local::remove(&item.local_path()).await?;
            self.ctx.store.remove_tree(item.local_relative()).await?;
            info!("Deleted locally");
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map(drop)
    }

    // ------------------------------------------------------------------
    // Renames and moves
    // ------------------------------------------------------------------

    /// Rename the remote object of `old` to the leaf name of `new`
    #[instrument(skip_all, fields(from = %old, to = %new))]
    pub async fn rename_remote(&self, old: &SyncItem, new: &SyncItem, record: &ChangeRecord) -> Result<()> {
        self.guarded(OperationKind::Upload, new.local_relative(), async {
            let remote = &self.ctx.remote;
            let (id, name) = (&record.remote_id, new.remote_name());
            let entry = with_retry(self.ctx.retry, "rename", || async move {
                remote.rename(id, name).await
            })
            .await?;
            self.rekey(old, new, &entry).await?;
            info!("Renamed remotely");
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map(drop)
    }

    /// Move the remote object of `old` into the parent folder of `new`
    #[instrument(skip_all, fields(from = %old, to = %new))]
    pub async fn move_remote(&self, old: &SyncItem, new: &SyncItem, record: &ChangeRecord) -> Result<()> {
        self.guarded(OperationKind::Upload, new.local_relative(), async {
            let from = old
                .remote_path()
                .parent()
                .ok_or_else(|| anyhow!("{old} has no remote parent"))?;
            let to = new
                .remote_path()
                .parent()
                .ok_or_else(|| anyhow!("{new} has no remote parent"))?;

            let remote = &self.ctx.remote;
            let (id, from_ref, to_ref) = (&record.remote_id, &from, &to);
            let entry = with_retry(self.ctx.retry, "move", || async move {
                remote.move_object(id, from_ref, to_ref).await
            })
            .await?;
            self.rekey(old, new, &entry).await?;
            info!("Moved remotely");
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map(drop)
    }

    /// Move the records of `old` to `new` and adopt the server's new timestamp
    async fn rekey(&self, old: &SyncItem, new: &SyncItem, entry: &RemoteEntry) -> Result<()> {
        let store = &self.ctx.store;
        store.move_item(old, new).await?;
        if let Some(mut record) = store.lookup(new.local_relative()).await? {
            record.remote_id = entry.id.clone();
            record.server_modified = Some(entry.last_modified);
            store.upsert(&record).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Rename the local entry at `item` out of the way and tell the user
    ///
    /// Returns the name of the backup. The remote side always keeps the
    /// original name.
    #[instrument(skip_all, fields(path = %item))]
    pub async fn backup_local(&self, item: &SyncItem) -> Result<String> {
        let path = item.local_path();
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("{item} has no local parent"))?
            .to_path_buf();
        let user = &self.ctx.repo.user;

        let name = ConflictNamer::generate_unique(item.local_name(), user, |candidate| {
            local::exists_blocking(&parent.join(candidate))
        })?;

        let was_folder = local::kind_of(&path).await? == Some(LocalKind::Folder);
        tokio::fs::rename(&path, parent.join(&name)).await?;
        if was_folder {
            self.ctx.store.remove_tree(item.local_relative()).await?;
        }

        info!(backup = %name, "Local version set aside after conflict");
        self.ctx
            .notifier
            .notify(&conflict_notice(item.local_relative().as_str(), &name, user))
            .await?;
        Ok(name)
    }
}
