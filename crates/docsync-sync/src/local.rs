//! Local filesystem helpers
//!
//! ## Design Decisions
//!
//! - **Atomic installs**: downloads are streamed into a hidden sibling
//!   (`.<name>.docsync-part`) and renamed over the target, so a reader never
//!   sees a half-written file under its final name.
//! - **Streaming hashes**: SHA-256 is computed chunk by chunk, both while
//!   downloading and when hashing a local file, so memory use does not grow
//!   with file size.
//! - **Symlinks are opaque**: anything that is neither a regular file nor a
//!   directory is reported as [`LocalKind::Other`] and left alone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use docsync_core::domain::{Checksum, DocumentMetadata};
use docsync_core::ports::ContentStream;

use crate::filter::TEMP_SUFFIX;

/// Read buffer for hashing and streaming
const CHUNK_SIZE: usize = 64 * 1024;

/// What a local path currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    File,
    Folder,
    /// Symlink, socket, device, ...
    Other,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub kind: LocalKind,
}

impl LocalEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == LocalKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == LocalKind::File
    }
}

fn kind_from(file_type: std::fs::FileType) -> LocalKind {
    if file_type.is_dir() {
        LocalKind::Folder
    } else if file_type.is_file() {
        LocalKind::File
    } else {
        LocalKind::Other
    }
}

/// Kind of `path`, or `None` when nothing is there
pub async fn kind_of(path: &Path) -> Result<Option<LocalKind>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(kind_from(meta.file_type()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Cannot stat {}", path.display())),
    }
}

/// True when `path` is an existing directory
pub async fn is_dir(path: &Path) -> bool {
    matches!(kind_of(path).await, Ok(Some(LocalKind::Folder)))
}

/// Blocking existence check, for use inside name-generation callbacks
pub fn exists_blocking(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Entries of `dir`, sorted by name
///
/// Names that are not valid UTF-8 cannot be represented remotely and are
/// skipped with a warning.
pub async fn list_dir(dir: &Path) -> Result<Vec<LocalEntry>> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Cannot list {}", dir.display()))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            warn!(dir = %dir.display(), "Skipping entry with non UTF-8 name");
            continue;
        };
        let kind = kind_from(entry.file_type().await?);
        entries.push(LocalEntry { name, kind });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn to_checksum(hasher: Sha256) -> Result<Checksum> {
    Ok(Checksum::new(format!("{:x}", hasher.finalize()))?)
}

/// Streaming SHA-256 of a local file
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn checksum_file(path: &Path) -> Result<Checksum> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    to_checksum(hasher)
}

/// Hidden sibling a download of `target` is streamed into
pub fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
}

/// Stream `content` into `tmp`, returning its checksum and length
///
/// Any file already at `tmp` is replaced; partial downloads are never resumed.
pub async fn write_stream(mut content: ContentStream, tmp: &Path) -> Result<(Checksum, u64)> {
    remove(tmp).await?;
    let mut file = tokio::fs::File::create(tmp)
        .await
        .with_context(|| format!("Cannot create {}", tmp.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = content.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    debug!(tmp = %tmp.display(), bytes = total, "Content streamed to temporary file");
    Ok((to_checksum(hasher)?, total))
}

/// Atomically move a finished temporary file to its final name
pub async fn install(tmp: &Path, target: &Path) -> Result<()> {
    tokio::fs::rename(tmp, target)
        .await
        .with_context(|| format!("Cannot install {}", target.display()))
}

/// Set the modification time of a file
pub async fn set_modified(path: &Path, time: DateTime<Utc>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&path)?;
        file.set_modified(time.into())?;
        Ok(())
    })
    .await?
}

/// Toggle the read-only permission bit
pub async fn set_read_only(path: &Path, read_only: bool) -> Result<()> {
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    if perms.readonly() != read_only {
        perms.set_readonly(read_only);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

/// Creation / modification times and size sent along with uploads
pub async fn document_metadata(path: &Path) -> Result<DocumentMetadata> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(DocumentMetadata {
        created: meta.created().ok().map(DateTime::<Utc>::from),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        size: meta.len(),
    })
}

/// Open a local file as a content stream
pub async fn open(path: &Path) -> Result<ContentStream> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    Ok(Box::new(file))
}

/// Remove a file or a whole directory tree; a missing path is not an error
pub async fn remove(path: &Path) -> Result<()> {
    let result = match kind_of(path).await? {
        None => return Ok(()),
        Some(LocalKind::Folder) => tokio::fs::remove_dir_all(path).await,
        Some(_) => tokio::fs::remove_file(path).await,
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Cannot remove {}", path.display())),
    }
}
