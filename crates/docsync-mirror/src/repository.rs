//! MirrorRepository - IRemoteRepository implementation over a directory
//!
//! Serves a directory (typically a mounted network share) as the remote
//! side of a folder pair. Remote path `/a/b` is `<base>/a/b`.
//!
//! ## Design Notes
//!
//! - Object identity is the `(device, inode)` pair, rendered as
//!   `"{dev:x}-{ino:x}"`. It survives renames and moves within the share,
//!   which is what the engine expects from a document repository.
//! - Ids are resolved through a `DashMap` index filled by every listing and
//!   lookup. An id missing from the index (e.g. after a restart) is found by
//!   walking the share once.
//! - Content replacement writes into the existing file so the id is kept.
//! - There is no change log; the engine falls back to full crawls. Whole
//!   subtrees can be listed in one call, which saves the engine a round
//!   trip per folder.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, trace};

use docsync_core::domain::{
    ChangeSet, ChangeToken, DocumentMetadata, RemoteCapabilities, RemoteDescendant, RemoteEntry,
    RemoteId, RemoteKind, RemotePath,
};
use docsync_core::ports::{ContentStream, IRemoteRepository, RemoteError};

use crate::error::{remote, MirrorError};

/// A directory served as a remote document repository
#[derive(Debug)]
pub struct MirrorRepository {
    base: PathBuf,
    /// id -> absolute path of the object under `base`
    index: DashMap<RemoteId, PathBuf>,
}

fn object_id(meta: &std::fs::Metadata) -> Result<RemoteId> {
    Ok(RemoteId::new(format!("{:x}-{:x}", meta.dev(), meta.ino()))?)
}

fn modified_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    DateTime::<Utc>::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH))
}

impl MirrorRepository {
    /// Create a repository serving `base`
    ///
    /// The directory is not checked here; see [`MirrorConnector`].
    ///
    /// [`MirrorConnector`]: crate::MirrorConnector
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            index: DashMap::new(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Filesystem path of a remote path
    fn fs_path(&self, path: &RemotePath) -> PathBuf {
        let mut out = self.base.clone();
        for component in path.as_str().split('/').filter(|c| !c.is_empty()) {
            out.push(component);
        }
        out
    }

    /// Remote path of a filesystem path under `base`
    fn remote_path(&self, path: &Path) -> Result<RemotePath> {
        let relative = path
            .strip_prefix(&self.base)
            .map_err(|_| remote(MirrorError::InvalidArgument(format!("{} is outside the mirror", path.display()))))?;
        let mut out = RemotePath::root();
        for component in relative.components() {
            let name = component.as_os_str().to_str().ok_or_else(|| {
                remote(MirrorError::InvalidArgument(format!("{} is not UTF-8", path.display())))
            })?;
            out = out.join(name)?;
        }
        Ok(out)
    }

    /// Build the entry for the object at `path`, recording its id
    async fn entry_at(&self, path: &Path) -> Result<RemoteEntry> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| remote(MirrorError::io(path, e)))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let id = object_id(&meta)?;

        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            RemoteKind::Folder
        } else if file_type.is_file() {
            RemoteKind::Document {
                size: meta.len(),
                writable: !meta.permissions().readonly(),
                checked_out_by: None,
            }
        } else if file_type.is_symlink() {
            RemoteKind::Unsupported("symbolic link".to_string())
        } else {
            RemoteKind::Unsupported("special file".to_string())
        };

        self.index.insert(id.clone(), path.to_path_buf());
        Ok(RemoteEntry {
            id,
            name,
            last_modified: modified_of(&meta),
            kind,
        })
    }

    /// Path of the object `id`
    async fn locate(&self, id: &RemoteId) -> Result<PathBuf> {
        let cached = self.index.get(id).map(|p| p.value().clone());
        if let Some(path) = cached {
            match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if object_id(&meta)? == *id => return Ok(path),
                _ => {
                    trace!(id = %id, path = %path.display(), "Stale index entry");
                    self.index.remove(id);
                }
            }
        }

        debug!(id = %id, "Id not indexed, walking the mirror");
        let mut pending = vec![self.base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| remote(MirrorError::io(&dir, e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| remote(MirrorError::io(&dir, e)))?
            {
                let path = entry.path();
                let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                    continue;
                };
                let found = object_id(&meta)?;
                self.index.insert(found.clone(), path.clone());
                if found == *id {
                    return Ok(path);
                }
                if meta.file_type().is_dir() {
                    pending.push(path);
                }
            }
        }
        Err(remote(MirrorError::NotFound(id.to_string())))
    }

    async fn require_dir(&self, path: &Path) -> Result<()> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(remote(MirrorError::NotADirectory(path.display().to_string()))),
            Err(e) => Err(remote(MirrorError::io(path, e))),
        }
    }

    async fn require_absent(&self, path: &Path) -> Result<()> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(_) => Err(remote(MirrorError::AlreadyExists(path.display().to_string()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(remote(MirrorError::io(path, e))),
        }
    }

    /// Point every index entry under `from` to the same place under `to`
    fn reindex(&self, from: &Path, to: &Path) {
        for mut item in self.index.iter_mut() {
            if let Ok(rest) = item.value().strip_prefix(from) {
                let moved = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                *item.value_mut() = moved;
            }
        }
    }

    fn forget(&self, root: &Path) {
        self.index.retain(|_, path| !path.starts_with(root));
    }

    async fn write_content(&self, path: &Path, mut content: ContentStream, create: bool) -> Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if create {
            options.create_new(true);
        } else {
            options.truncate(true);
        }
        let mut file = options
            .open(path)
            .await
            .map_err(|e| remote(MirrorError::io(path, e)))?;
        tokio::io::copy(&mut content, &mut file)
            .await
            .map_err(|e| remote(MirrorError::io(path, e)))?;
        file.flush().await.map_err(|e| remote(MirrorError::io(path, e)))?;
        file.sync_all().await.map_err(|e| remote(MirrorError::io(path, e)))?;
        Ok(())
    }

    /// Move the object at `from` to `to`, which must not exist
    async fn relocate(&self, from: &Path, to: &Path) -> Result<RemoteEntry> {
        self.require_absent(to).await?;
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| remote(MirrorError::io(from, e)))?;
        self.reindex(from, to);
        self.entry_at(to).await
    }
}

#[async_trait::async_trait]
impl IRemoteRepository for MirrorRepository {
    fn capabilities(&self) -> RemoteCapabilities {
        RemoteCapabilities {
            change_log: false,
            descendants: true,
        }
    }

    #[instrument(skip_all, fields(folder = %folder))]
    async fn get_children(&self, folder: &RemotePath) -> Result<Vec<RemoteEntry>> {
        let dir = self.fs_path(folder);
        self.require_dir(&dir).await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| remote(MirrorError::io(&dir, e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| remote(MirrorError::io(&dir, e)))?
        {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "Skipping non UTF-8 name"),
            }
        }
        names.sort();

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            match self.entry_at(&dir.join(&name)).await {
                Ok(entry) => children.push(entry),
                // Removed between the listing and the stat
                Err(err) if matches!(err.downcast_ref::<RemoteError>(), Some(RemoteError::NotFound(_))) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(children)
    }

    #[instrument(skip_all, fields(folder = %folder))]
    async fn get_descendants(&self, folder: &RemotePath) -> Result<Vec<RemoteDescendant>> {
        let mut descendants = Vec::new();
        let mut pending = vec![folder.clone()];
        while let Some(parent) = pending.pop() {
            let children = match self.get_children(&parent).await {
                Ok(children) => children,
                // A subfolder removed while walking
                Err(err)
                    if parent != *folder
                        && matches!(err.downcast_ref::<RemoteError>(), Some(RemoteError::NotFound(_))) =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            };
            for entry in children.iter().rev() {
                if !entry.is_folder() {
                    continue;
                }
                match parent.join(&entry.name) {
                    Ok(path) => pending.push(path),
                    Err(err) => debug!(name = %entry.name, error = %err, "Not descending into folder"),
                }
            }
            descendants.extend(children.into_iter().map(|entry| RemoteDescendant {
                parent: parent.clone(),
                entry,
            }));
        }
        trace!(count = descendants.len(), "Listed subtree");
        Ok(descendants)
    }

    async fn get_entry(&self, path: &RemotePath) -> Result<Option<RemoteEntry>> {
        match self.entry_at(&self.fs_path(path)).await {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if matches!(err.downcast_ref::<RemoteError>(), Some(RemoteError::NotFound(_))) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_content(&self, id: &RemoteId) -> Result<ContentStream> {
        let path = self.locate(id).await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| remote(MirrorError::io(&path, e)))?;
        if file
            .metadata()
            .await
            .map_err(|e| remote(MirrorError::io(&path, e)))?
            .is_dir()
        {
            return Err(remote(MirrorError::IsADirectory(path.display().to_string())));
        }
        Ok(Box::new(file))
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn set_content(
        &self,
        id: &RemoteId,
        content: ContentStream,
        _metadata: &DocumentMetadata,
    ) -> Result<RemoteEntry> {
        let path = self.locate(id).await?;
        let current = self.entry_at(&path).await?;
        match current.kind {
            RemoteKind::Document { writable: false, .. } => {
                return Err(remote(MirrorError::PermissionDenied(path.display().to_string())))
            }
            RemoteKind::Document { .. } => {}
            _ => return Err(remote(MirrorError::IsADirectory(path.display().to_string()))),
        }
        self.write_content(&path, content, false).await?;
        debug!(path = %path.display(), "Content replaced");
        self.entry_at(&path).await
    }

    #[instrument(skip_all, fields(parent = %parent, name = name))]
    async fn create_document(
        &self,
        parent: &RemotePath,
        name: &str,
        content: ContentStream,
        _metadata: &DocumentMetadata,
    ) -> Result<RemoteEntry> {
        let dir = self.fs_path(parent);
        self.require_dir(&dir).await?;
        let path = dir.join(name);
        if let Err(err) = self.write_content(&path, content, true).await {
            // Do not leave a truncated document behind, unless it was not ours
            if !matches!(err.downcast_ref::<RemoteError>(), Some(RemoteError::Constraint(_))) {
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    debug!(error = %cleanup, "Cannot remove partial document");
                }
            }
            return Err(err);
        }
        self.entry_at(&path).await
    }

    #[instrument(skip_all, fields(parent = %parent, name = name))]
    async fn create_folder(&self, parent: &RemotePath, name: &str) -> Result<RemoteEntry> {
        let dir = self.fs_path(parent);
        self.require_dir(&dir).await?;
        let path = dir.join(name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| remote(MirrorError::io(&path, e)))?;
        self.entry_at(&path).await
    }

    #[instrument(skip_all, fields(id = %id, recursive = recursive))]
    async fn delete(&self, id: &RemoteId, recursive: bool) -> Result<()> {
        let path = self.locate(id).await?;
        if path == self.base {
            return Err(remote(MirrorError::InvalidArgument("cannot delete the mirror root".into())));
        }
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| remote(MirrorError::io(&path, e)))?;

        let removed = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&path).await
            } else {
                let mut entries = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| remote(MirrorError::io(&path, e)))?;
                if entries
                    .next_entry()
                    .await
                    .map_err(|e| remote(MirrorError::io(&path, e)))?
                    .is_some()
                {
                    return Err(remote(MirrorError::NotEmpty(path.display().to_string())));
                }
                tokio::fs::remove_dir(&path).await
            }
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| remote(MirrorError::io(&path, e)))?;

        self.forget(&path);
        debug!(path = %path.display(), recursive, "Deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(id = %id, new_name = new_name))]
    async fn rename(&self, id: &RemoteId, new_name: &str) -> Result<RemoteEntry> {
        let path = self.locate(id).await?;
        let parent = path
            .parent()
            .filter(|_| path != self.base)
            .ok_or_else(|| remote(MirrorError::InvalidArgument("cannot rename the mirror root".into())))?;
        let target = parent.join(new_name);
        self.relocate(&path, &target).await
    }

    #[instrument(skip_all, fields(id = %id, from = %from, to = %to))]
    async fn move_object(&self, id: &RemoteId, from: &RemotePath, to: &RemotePath) -> Result<RemoteEntry> {
        let path = self.locate(id).await?;
        let current_parent = self.remote_path(path.parent().unwrap_or(&self.base))?;
        if current_parent != *from {
            return Err(remote(MirrorError::InvalidArgument(format!(
                "{} is not in {from}",
                path.display()
            ))));
        }
        let name = path
            .file_name()
            .ok_or_else(|| remote(MirrorError::InvalidArgument("cannot move the mirror root".into())))?;
        let dir = self.fs_path(to);
        self.require_dir(&dir).await?;
        self.relocate(&path, &dir.join(name)).await
    }

    async fn change_log_token(&self) -> Result<ChangeToken> {
        Err(RemoteError::NotSupported("change log".into()).into())
    }

    async fn get_changes(&self, _since: &ChangeToken) -> Result<ChangeSet> {
        Err(RemoteError::NotSupported("change log".into()).into())
    }
}
