//! Sync scheduler - turns timers, watcher activity and user requests into passes
//!
//! One [`SyncScheduler`] runs per folder pair. It sleeps until one of
//! these happens, then runs a pass:
//!
//! ```text
//!   poll interval tick ─────────────┐
//!   watcher activity ──(debounce)───┼──► Synchronize::sync()
//!   SchedulerHandle::request_sync ──┘
//!   shutdown ──────────────────────────► exit
//! ```
//!
//! Watcher activity is debounced: the pass starts once the folder has been
//! quiet for the debounce delay, so a burst of saves yields one pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{SyncOrchestrator, SyncReport};
use crate::SyncError;

/// Anything that can run a synchronization pass
#[async_trait]
pub trait Synchronize: Send + Sync {
    async fn sync(&self) -> Result<SyncReport, SyncError>;
}

#[async_trait]
impl Synchronize for SyncOrchestrator {
    async fn sync(&self) -> Result<SyncReport, SyncError> {
        SyncOrchestrator::sync(self).await
    }
}

/// Requests passes from outside the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    requested: Arc<Notify>,
}

impl SchedulerHandle {
    /// Run a pass as soon as possible, bypassing the debounce delay
    ///
    /// Requests made while a pass runs collapse into one follow-up pass.
    pub fn request_sync(&self) {
        debug!("Sync requested");
        self.requested.notify_one();
    }
}

/// Schedules passes for one folder pair
pub struct SyncScheduler {
    target: Arc<dyn Synchronize>,
    activity: Arc<Notify>,
    requested: Arc<Notify>,
    poll_interval: Duration,
    debounce: Duration,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Creates a new `SyncScheduler`
    ///
    /// # Arguments
    /// * `target` - What runs the passes (normally a [`SyncOrchestrator`])
    /// * `activity` - Signalled by the local watcher for every event
    /// * `poll_interval` - Time between passes when nothing happens
    /// * `debounce` - Quiet time required after watcher activity
    /// * `shutdown` - Stops the loop when cancelled
    pub fn new(
        target: Arc<dyn Synchronize>,
        activity: Arc<Notify>,
        poll_interval: Duration,
        debounce: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        info!(
            poll_secs = poll_interval.as_secs(),
            debounce_ms = debounce.as_millis() as u64,
            "Creating sync scheduler"
        );
        Self {
            target,
            activity,
            requested: Arc::new(Notify::new()),
            poll_interval,
            debounce,
            shutdown,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            requested: Arc::clone(&self.requested),
        }
    }

    /// Main loop; the first pass runs immediately
    ///
    /// Returns once the shutdown token is cancelled.
    pub async fn run(self) {
        info!("Sync scheduler starting");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.requested.notified() => {
                    debug!("Running requested pass");
                }
                _ = self.activity.notified() => {
                    if !self.settle().await {
                        break;
                    }
                    debug!("Local activity settled");
                }
                _ = ticker.tick() => {
                    debug!("Poll interval elapsed");
                }
            }

            self.run_pass().await;
            // A pass just ran, the next poll is a full interval away
            ticker.reset();
        }

        info!("Sync scheduler stopped");
    }

    /// Wait until no activity arrived for the debounce delay
    ///
    /// Returns false on shutdown.
    async fn settle(&self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = self.activity.notified() => continue,
                _ = tokio::time::sleep(self.debounce) => return true,
            }
        }
    }

    async fn run_pass(&self) {
        match self.target.sync().await {
            Ok(report) => debug!(status = ?report.status, "Scheduled pass done"),
            Err(err) => warn!(error = %err, "Scheduled pass failed, retrying at the next wake-up"),
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
