//! Pass orchestration

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use docsync_core::domain::RemoteCapabilities;
use docsync_core::ports::RemoteError;
use docsync_sync::{
    ChangeEvent, PassMode, PassStatus, SyncError, SyncState, WatcherQueue,
};

use crate::common::{Harness, MemoryConnector, MemoryRemote, OpCounts, REMOTE_ROOT};

fn connector(h: &Harness) -> Arc<MemoryConnector> {
    Arc::new(MemoryConnector::new(Arc::clone(&h.remote)))
}

async fn with_change_log() -> Harness {
    let capabilities = RemoteCapabilities {
        change_log: true,
        descendants: false,
    };
    Harness::build(MemoryRemote::with_capabilities(REMOTE_ROOT, capabilities), |_| {}).await
}

#[tokio::test]
async fn test_first_pass_is_a_first_sync_then_incremental() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    let conn = connector(&h);
    let orchestrator = h.orchestrator(&conn);
    assert_eq!(orchestrator.state(), SyncState::Disconnected);

    let report = orchestrator.sync().await.unwrap();
    assert_eq!(report.status, PassStatus::Success);
    assert_eq!(report.mode, Some(PassMode::FirstSync));
    assert_eq!(orchestrator.state(), SyncState::Idle);
    assert_eq!(h.read("doc.txt").unwrap(), b"X");
    assert!(h.store.last_full_sync().await.unwrap().is_some());

    let report = orchestrator.sync().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::Incremental));
    // The session is kept between passes
    assert_eq!(OpCounts::get(&conn.connects), 1);
}

#[tokio::test]
async fn test_first_sync_keeps_pre_existing_local_work() {
    let h = Harness::new().await;
    h.write("plan.txt", b"local plan");
    h.write("notes/idea.txt", b"idea");
    h.remote.add_document("/team/plan.txt", b"remote plan");
    let orchestrator = h.orchestrator(&connector(&h));

    assert!(orchestrator.sync().await.unwrap().is_success());

    assert_eq!(h.read("plan.txt").unwrap(), b"remote plan");
    assert_eq!(h.read("plan (conflict alice).txt").unwrap(), b"local plan");
    assert_eq!(h.remote.content("/team/notes/idea.txt").unwrap(), b"idea");

    // The backup is an ordinary new file from then on
    assert!(orchestrator.sync().await.unwrap().is_success());
    assert_eq!(
        h.remote.content("/team/plan (conflict alice).txt").unwrap(),
        b"local plan"
    );
}

#[tokio::test]
async fn test_partial_pass_is_reported() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    h.remote.inject("get_content", None, RemoteError::PermissionDenied("no".into()), Some(1));
    let orchestrator = h.orchestrator(&connector(&h));

    let report = orchestrator.sync().await.unwrap();
    assert_eq!(report.status, PassStatus::Partial);
    assert!(h.store.last_full_sync().await.unwrap().is_none());

    // Still a first sync until one completes
    let report = orchestrator.sync().await.unwrap();
    assert_eq!(report.status, PassStatus::Success);
    assert_eq!(report.mode, Some(PassMode::FirstSync));
}

// ============================================================================
// Change log
// ============================================================================

#[tokio::test]
async fn test_change_log_narrows_the_crawl() {
    let h = with_change_log().await;
    h.remote.add_folder("/team/sub");
    h.remote.add_folder("/team/other");
    let orchestrator = h.orchestrator(&connector(&h));

    assert!(orchestrator.sync().await.unwrap().is_success());
    assert_eq!(h.store.change_log_token().await.unwrap().unwrap().to_string(), "2");

    h.remote.add_document("/team/sub/new.txt", b"new");
    h.remote.reset_counts();
    let report = orchestrator.sync().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::ChangeLog));
    assert_eq!(h.read("sub/new.txt").unwrap(), b"new");
    assert_eq!(OpCounts::get(&h.remote.counts.get_changes), 1);
    // Only "sub" was listed
    assert_eq!(OpCounts::get(&h.remote.counts.get_children), 1);
    assert_eq!(h.store.change_log_token().await.unwrap().unwrap().to_string(), "3");
}

#[tokio::test]
async fn test_change_log_follows_remote_move() {
    let h = with_change_log().await;
    h.remote.add_folder("/team/a");
    h.remote.add_folder("/team/b");
    h.remote.add_document("/team/a/f.txt", b"f");
    let orchestrator = h.orchestrator(&connector(&h));
    assert!(orchestrator.sync().await.unwrap().is_success());

    h.remote.move_path("/team/a/f.txt", "/team/b/f.txt");
    let report = orchestrator.sync().await.unwrap();

    assert_eq!(report.mode, Some(PassMode::ChangeLog));
    assert!(!h.exists("a/f.txt"));
    assert_eq!(h.read("b/f.txt").unwrap(), b"f");
}

#[tokio::test]
async fn test_rejected_token_falls_back_to_full_crawl() {
    let h = with_change_log().await;
    let orchestrator = h.orchestrator(&connector(&h));
    assert!(orchestrator.sync().await.unwrap().is_success());

    h.remote.add_document("/team/doc.txt", b"X");
    h.remote.inject(
        "get_changes",
        None,
        RemoteError::InvalidArgument("token expired".into()),
        Some(1),
    );
    let report = orchestrator.sync().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::Incremental));
    assert_eq!(h.read("doc.txt").unwrap(), b"X");
}

#[tokio::test]
async fn test_token_is_not_persisted_when_the_remote_fails() {
    let h = with_change_log().await;
    h.remote.add_folder("/team/sub");
    let orchestrator = h.orchestrator(&connector(&h));
    assert!(orchestrator.sync().await.unwrap().is_success());
    let before = h.store.change_log_token().await.unwrap();

    h.remote.add_document("/team/sub/new.txt", b"new");
    h.remote.inject("get_children", None, RemoteError::Connection("reset".into()), None);
    let err = orchestrator.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Systemic(_)));
    assert_eq!(h.store.change_log_token().await.unwrap(), before);
    assert_eq!(orchestrator.state(), SyncState::Connected);

    // The change is still ahead of the stored token
    h.remote.clear_faults();
    assert!(orchestrator.sync().await.unwrap().is_success());
    assert_eq!(h.read("sub/new.txt").unwrap(), b"new");
}

// ============================================================================
// Failures and control
// ============================================================================

// ============================================================================
// Per-folder capability overrides
// ============================================================================

#[tokio::test]
async fn test_change_log_can_be_disabled_per_folder() {
    let capabilities = RemoteCapabilities {
        change_log: true,
        descendants: false,
    };
    let remote = MemoryRemote::with_capabilities(REMOTE_ROOT, capabilities);
    let h = Harness::build(remote, |repo| repo.change_log = Some(false)).await;
    h.remote.add_folder("/team/sub");
    let orchestrator = h.orchestrator(&connector(&h));

    assert!(orchestrator.sync().await.unwrap().is_success());
    assert!(h.store.change_log_token().await.unwrap().is_none());

    h.remote.add_document("/team/sub/new.txt", b"new");
    h.remote.reset_counts();
    let report = orchestrator.sync().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::Incremental));
    assert_eq!(h.read("sub/new.txt").unwrap(), b"new");
    assert_eq!(OpCounts::get(&h.remote.counts.get_changes), 0);
    // Full crawl: the root and "sub"
    assert_eq!(OpCounts::get(&h.remote.counts.get_children), 2);
}

#[tokio::test]
async fn test_subtree_listing_can_be_disabled_per_folder() {
    let capabilities = RemoteCapabilities {
        change_log: false,
        descendants: true,
    };
    let remote = MemoryRemote::with_capabilities(REMOTE_ROOT, capabilities);
    let h = Harness::build(remote, |repo| repo.descendants = Some(false)).await;
    h.remote.add_folder("/team/sub");
    h.remote.add_document("/team/sub/doc.txt", b"D");
    let orchestrator = h.orchestrator(&connector(&h));

    assert!(orchestrator.sync().await.unwrap().is_success());

    assert_eq!(h.read("sub/doc.txt").unwrap(), b"D");
    assert_eq!(OpCounts::get(&h.remote.counts.get_descendants), 0);
    assert_eq!(OpCounts::get(&h.remote.counts.get_children), 2);
}

#[tokio::test]
async fn test_subtree_listing_is_used_when_offered() {
    let capabilities = RemoteCapabilities {
        change_log: false,
        descendants: true,
    };
    let h = Harness::build(MemoryRemote::with_capabilities(REMOTE_ROOT, capabilities), |_| {}).await;
    h.remote.add_folder("/team/sub");
    h.remote.add_document("/team/sub/doc.txt", b"D");
    let orchestrator = h.orchestrator(&connector(&h));

    assert!(orchestrator.sync().await.unwrap().is_success());

    assert_eq!(h.read("sub/doc.txt").unwrap(), b"D");
    assert_eq!(OpCounts::get(&h.remote.counts.get_descendants), 1);
    assert_eq!(OpCounts::get(&h.remote.counts.get_children), 0);
}

#[tokio::test]
async fn test_unauthorized_drops_the_session() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    h.remote.inject("get_children", None, RemoteError::Unauthorized("expired".into()), Some(1));
    let conn = connector(&h);
    let orchestrator = h.orchestrator(&conn);

    let err = orchestrator.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Systemic(_)));
    assert_eq!(orchestrator.state(), SyncState::Disconnected);

    assert!(orchestrator.sync().await.unwrap().is_success());
    assert_eq!(OpCounts::get(&conn.connects), 2);
    assert_eq!(h.read("doc.txt").unwrap(), b"X");
}

#[tokio::test]
async fn test_missing_local_root_is_fatal() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    let orchestrator = h.orchestrator(&connector(&h));
    assert!(orchestrator.sync().await.unwrap().is_success());

    std::fs::remove_dir_all(h.root()).unwrap();
    h.remote.reset_counts();
    let err = orchestrator.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Fatal(_)));
    assert!(h.remote.exists("/team/doc.txt"));
    assert_eq!(h.remote.counts.writes(), 0);
}

#[tokio::test]
async fn test_suspended_pass_can_be_cancelled() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    let orchestrator = Arc::new(h.orchestrator(&connector(&h)));

    h.control.suspend();
    assert!(orchestrator.is_suspended());
    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = orchestrator.sync().await.unwrap();
    assert_eq!(report.status, PassStatus::Busy);

    h.control.cancel_pass();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, PassStatus::Aborted);
    assert!(!h.exists("doc.txt"));

    h.control.resume();
    let report = orchestrator.sync().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::FirstSync));
    assert_eq!(h.read("doc.txt").unwrap(), b"X");
}

#[tokio::test]
async fn test_watcher_events_drive_incremental_passes() {
    let h = Harness::new().await;
    let id = h.remote.add_document("/team/a.txt", b"a");
    let queue = WatcherQueue::new(Duration::from_secs(15), Duration::from_secs(2)).shared();
    let orchestrator = h.orchestrator(&connector(&h)).with_watch_queue(Arc::clone(&queue));
    assert!(orchestrator.sync().await.unwrap().is_success());

    std::fs::rename(h.path("a.txt"), h.path("b.txt")).unwrap();
    docsync_sync::watcher::lock_queue(&queue).push_at(
        ChangeEvent::Renamed {
            old: h.path("a.txt"),
            new: h.path("b.txt"),
        },
        Instant::now(),
    );
    h.remote.reset_counts();
    let report = orchestrator.sync().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, Some(PassMode::Incremental));
    assert_eq!(h.remote.id_of("/team/b.txt"), Some(id));
    assert_eq!(OpCounts::get(&h.remote.counts.rename), 1);
    assert_eq!(OpCounts::get(&h.remote.counts.delete), 0);
    assert_eq!(OpCounts::get(&h.remote.counts.create_document), 0);
    assert!(docsync_sync::watcher::lock_queue(&queue).is_empty());
}
