//! Cooperative suspend and cancellation
//!
//! Engines call [`SyncControl::checkpoint`] before every recursive step and
//! every watcher event. A checkpoint returns immediately while running,
//! parks while suspended, and fails with [`SyncError::Aborted`] once the
//! current pass (or the whole process) is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::SyncError;

/// Upper bound on one wait while suspended, so cancellation is noticed
const SUSPEND_POLL: Duration = Duration::from_millis(250);

/// Run-state shared between a folder's worker and its controllers
#[derive(Debug)]
pub struct SyncControl {
    shutdown: CancellationToken,
    pass: Mutex<CancellationToken>,
    suspended: AtomicBool,
    resumed: Notify,
}

impl SyncControl {
    /// Control whose passes are children of `shutdown`
    pub fn new(shutdown: CancellationToken) -> Self {
        let pass = shutdown.child_token();
        Self {
            shutdown,
            pass: Mutex::new(pass),
            suspended: AtomicBool::new(false),
            resumed: Notify::new(),
        }
    }

    /// Fresh token for a new pass; the previous one is dropped
    pub fn start_pass(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        let mut guard = self.pass.lock().unwrap_or_else(|e| e.into_inner());
        *guard = token.clone();
        token
    }

    fn current(&self) -> CancellationToken {
        self.pass.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Abort the running pass; later passes are unaffected
    pub fn cancel_pass(&self) {
        info!("Cancelling current sync pass");
        self.current().cancel();
    }

    /// Abort everything, now and for good
    pub fn shutdown(&self) {
        info!("Shutting down sync control");
        self.shutdown.cancel();
        self.resumed.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            info!("Sync suspended");
        }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!("Sync resumed");
        }
        self.resumed.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Suspension point
    ///
    /// # Errors
    /// [`SyncError::Aborted`] when the pass or the process was cancelled,
    /// including while parked in a suspension.
    pub async fn checkpoint(&self) -> Result<(), SyncError> {
        let token = self.current();
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Aborted);
            }
            if !self.is_suspended() {
                return Ok(());
            }
            debug!("Checkpoint parked while suspended");
            tokio::select! {
                _ = token.cancelled() => return Err(SyncError::Aborted),
                _ = self.resumed.notified() => {}
                _ = tokio::time::sleep(SUSPEND_POLL) => {}
            }
        }
    }

    /// Sleep until `deadline`, waking early with `Aborted` on cancellation
    pub async fn sleep_until(&self, deadline: Instant) -> Result<(), SyncError> {
        let token = self.current();
        tokio::select! {
            _ = token.cancelled() => Err(SyncError::Aborted),
            _ = tokio::time::sleep_until(deadline) => self.checkpoint().await,
        }
    }
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
