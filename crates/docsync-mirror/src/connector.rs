//! Session factory for the mirror adapter

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use docsync_core::ports::{IRemoteConnector, IRemoteRepository};

use crate::error::{remote, MirrorError};
use crate::repository::MirrorRepository;

/// Connects to a directory served by [`MirrorRepository`]
///
/// The repository (and its id index) is shared by every session; connecting
/// only checks that the directory is reachable, which is what fails when a
/// network share is unmounted.
#[derive(Debug, Clone)]
pub struct MirrorConnector {
    repository: Arc<MirrorRepository>,
}

impl MirrorConnector {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            repository: Arc::new(MirrorRepository::new(base)),
        }
    }
}

#[async_trait::async_trait]
impl IRemoteConnector for MirrorConnector {
    async fn connect(&self) -> Result<Arc<dyn IRemoteRepository>> {
        let base = self.repository.base();
        match tokio::fs::metadata(base).await {
            Ok(meta) if meta.is_dir() => {
                info!(base = %base.display(), "Mirror session opened");
                Ok(Arc::clone(&self.repository) as Arc<dyn IRemoteRepository>)
            }
            Ok(_) => Err(remote(MirrorError::BaseUnavailable(format!(
                "{} is not a directory",
                base.display()
            )))),
            Err(err) => {
                warn!(base = %base.display(), error = %err, "Mirror base unreachable");
                Err(remote(MirrorError::BaseUnavailable(format!(
                    "{}: {err}",
                    base.display()
                ))))
            }
        }
    }
}
