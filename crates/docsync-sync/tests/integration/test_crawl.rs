//! Full crawl reconciliation

use sha2::{Digest, Sha256};

use docsync_core::config::SyncMode;
use docsync_core::domain::{Checksum, OperationKind, RemoteCapabilities};
use docsync_core::ports::{NoticeKind, RemoteError};

use crate::common::{rel, Harness, MemoryRemote, OpCounts, REMOTE_ROOT};

fn sha256(content: &[u8]) -> Checksum {
    Checksum::new(format!("{:x}", Sha256::digest(content))).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_new_remote_document_is_downloaded_and_recorded() {
    let h = Harness::new().await;
    let id = h.remote.add_document("/team/doc.txt", b"X");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("doc.txt").unwrap(), b"X");
    let record = h.record("doc.txt").await.unwrap();
    assert_eq!(record.remote_id, id);
    assert_eq!(record.server_modified, h.remote.modified("/team/doc.txt"));
    assert_eq!(record.checksum, Some(sha256(b"X")));
    assert!(!record.is_folder);

    h.remote.reset_counts();
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.remote.counts.writes(), 0);
    assert_eq!(h.remote.counts.downloads(), 0);
}

#[tokio::test]
async fn test_new_local_folder_is_uploaded_recursively() {
    let h = Harness::new().await;
    h.write("newdir/a.txt", b"alpha");
    h.write("newdir/deeper/b.txt", b"beta");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert!(h.remote.is_folder("/team/newdir"));
    assert!(h.remote.is_folder("/team/newdir/deeper"));
    assert_eq!(h.remote.content("/team/newdir/a.txt").unwrap(), b"alpha");
    assert_eq!(h.remote.content("/team/newdir/deeper/b.txt").unwrap(), b"beta");

    let folder = h.record("newdir").await.unwrap();
    assert!(folder.is_folder);
    assert_eq!(Some(folder.remote_id), h.remote.id_of("/team/newdir"));
    let file = h.record("newdir/deeper/b.txt").await.unwrap();
    assert_eq!(file.checksum, Some(sha256(b"beta")));
}

#[tokio::test]
async fn test_second_crawl_of_mixed_tree_is_idempotent() {
    let h = Harness::new().await;
    h.remote.add_folder("/team/shared");
    h.remote.add_document("/team/shared/remote.txt", b"r");
    h.remote.add_document("/team/top.txt", b"t");
    h.write("shared/local.txt", b"l");
    h.write("mine/notes.md", b"n");

    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.list("shared"), vec!["local.txt", "remote.txt"]);
    assert!(h.remote.exists("/team/shared/local.txt"));
    assert!(h.remote.exists("/team/mine/notes.md"));

    h.remote.reset_counts();
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.remote.counts.writes(), 0);
    assert_eq!(h.remote.counts.downloads(), 0);
}

#[tokio::test]
async fn test_subtree_listing_serves_every_folder_of_the_crawl() {
    let capabilities = RemoteCapabilities {
        change_log: false,
        descendants: true,
    };
    let h = Harness::build(MemoryRemote::with_capabilities(REMOTE_ROOT, capabilities), |_| {}).await;
    h.remote.add_folder("/team/a");
    h.remote.add_folder("/team/a/deep");
    h.remote.add_folder("/team/empty");
    h.remote.add_document("/team/a/x.txt", b"x");
    h.remote.add_document("/team/a/deep/y.txt", b"y");
    h.remote.add_document("/team/top.txt", b"t");
    h.write("a/local.txt", b"l");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("a/x.txt").unwrap(), b"x");
    assert_eq!(h.read("a/deep/y.txt").unwrap(), b"y");
    assert_eq!(h.read("top.txt").unwrap(), b"t");
    assert!(h.list("empty").is_empty());
    assert_eq!(h.remote.content("/team/a/local.txt").unwrap(), b"l");
    assert_eq!(OpCounts::get(&h.remote.counts.get_descendants), 1);
    assert_eq!(OpCounts::get(&h.remote.counts.get_children), 0);

    // Each crawl takes a fresh snapshot
    h.remote.add_document("/team/a/deep/z.txt", b"z");
    h.remote.reset_counts();
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.read("a/deep/z.txt").unwrap(), b"z");
    assert_eq!(OpCounts::get(&h.remote.counts.get_descendants), 1);
    assert_eq!(h.remote.counts.writes(), 0);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_both_sides_changed_keeps_both_versions() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"base");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("doc.txt", b"mine");
    h.remote.update_document("/team/doc.txt", b"theirs");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("doc.txt").unwrap(), b"theirs");
    assert_eq!(h.read("doc (conflict alice).txt").unwrap(), b"mine");
    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"theirs");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NoticeKind::Conflict);
    assert_eq!(sent[0].path, "doc.txt");
    assert!(sent[0].body.contains("doc (conflict alice).txt"));
    assert!(sent[0].body.contains("alice"));

    let record = h.record("doc.txt").await.unwrap();
    assert_eq!(record.checksum, Some(sha256(b"theirs")));
}

#[tokio::test]
async fn test_remote_change_without_local_change_overwrites() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.remote.update_document("/team/doc.txt", b"v2");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("doc.txt").unwrap(), b"v2");
    assert_eq!(h.list(""), vec!["doc.txt"]);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_local_change_is_pushed() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("doc.txt", b"v2 local");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"v2 local");
    assert_eq!(OpCounts::get(&h.remote.counts.set_content), 1);
    let record = h.record("doc.txt").await.unwrap();
    assert_eq!(record.checksum, Some(sha256(b"v2 local")));
    assert_eq!(record.server_modified, h.remote.modified("/team/doc.txt"));
}

#[tokio::test]
async fn test_local_folder_yields_name_to_remote_document() {
    let h = Harness::new().await;
    h.write("report/draft.txt", b"draft");
    h.remote.add_document("/team/report", b"final");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("report").unwrap(), b"final");
    assert_eq!(h.read("report (conflict alice)/draft.txt").unwrap(), b"draft");
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_first_contact_with_different_content_backs_up_local() {
    let h = Harness::new().await;
    h.write("plan.txt", b"local plan");
    h.remote.add_document("/team/plan.txt", b"remote plan");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("plan.txt").unwrap(), b"remote plan");
    assert_eq!(h.read("plan (conflict alice).txt").unwrap(), b"local plan");
}

#[tokio::test]
async fn test_first_contact_with_identical_content_is_adopted() {
    let h = Harness::new().await;
    h.write("same.txt", b"identical");
    h.remote.add_document("/team/same.txt", b"identical");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.list(""), vec!["same.txt"]);
    assert!(h.notifier.sent().is_empty());
    assert!(h.record("same.txt").await.is_some());
}

// ============================================================================
// Deletions
// ============================================================================

#[tokio::test]
async fn test_remote_deletion_removes_local_copy() {
    let h = Harness::new().await;
    h.remote.add_folder("/team/dir");
    h.remote.add_document("/team/dir/a.txt", b"a");
    h.remote.add_document("/team/b.txt", b"b");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.remote.remove("/team/dir");
    h.remote.remove("/team/b.txt");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert!(h.list("").is_empty());
    assert!(h.record("dir").await.is_none());
    assert!(h.record("dir/a.txt").await.is_none());
    assert!(h.record("b.txt").await.is_none());
}

#[tokio::test]
async fn test_remote_deletion_of_locally_modified_file_uploads_it_again() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("doc.txt", b"edited");
    h.remote.remove("/team/doc.txt");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"edited");
    assert_eq!(h.read("doc.txt").unwrap(), b"edited");
}

#[tokio::test]
async fn test_remote_deletion_of_folder_with_new_local_file_uploads_it_again() {
    let h = Harness::new().await;
    h.remote.add_folder("/team/dir");
    h.remote.add_document("/team/dir/a.txt", b"a");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("dir/new.txt", b"new");
    h.remote.remove("/team/dir");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert!(h.remote.is_folder("/team/dir"));
    assert_eq!(h.remote.content("/team/dir/new.txt").unwrap(), b"new");
    assert_eq!(h.remote.content("/team/dir/a.txt").unwrap(), b"a");
}

#[tokio::test]
async fn test_local_deletion_is_propagated() {
    let h = Harness::new().await;
    h.remote.add_folder("/team/dir");
    h.remote.add_document("/team/dir/a.txt", b"a");
    h.remote.add_document("/team/b.txt", b"b");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.delete("dir");
    h.delete("b.txt");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert!(!h.remote.exists("/team/dir"));
    assert!(!h.remote.exists("/team/b.txt"));
    assert!(h.record("dir/a.txt").await.is_none());
}

#[tokio::test]
async fn test_local_deletion_loses_against_newer_remote_version() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.delete("doc.txt");
    h.remote.update_document("/team/doc.txt", b"v2");
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("doc.txt").unwrap(), b"v2");
    assert_eq!(OpCounts::get(&h.remote.counts.delete), 0);
}

#[tokio::test]
async fn test_refused_remote_delete_restores_local_copy() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"keep me");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.delete("doc.txt");
    h.remote.inject(
        "delete",
        Some("/team/doc.txt"),
        RemoteError::PermissionDenied("read-only library".into()),
        None,
    );
    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.read("doc.txt").unwrap(), b"keep me");
    assert!(h.remote.exists("/team/doc.txt"));
    assert!(h.record("doc.txt").await.is_some());
}

// ============================================================================
// Failures and skips
// ============================================================================

#[tokio::test]
async fn test_retry_counter_saturates() {
    let h = Harness::with_repo(|repo| repo.max_download_retries = 2).await;
    h.remote.add_document("/team/poison.txt", b"p");
    h.remote.add_document("/team/fine.txt", b"f");
    h.remote.inject(
        "get_content",
        Some("/team/poison.txt"),
        RemoteError::PermissionDenied("no".into()),
        None,
    );

    assert!(!h.crawl().crawl_root().await.unwrap());
    assert!(!h.crawl().crawl_root().await.unwrap());
    let attempts = h
        .store
        .retry_count(&rel("poison.txt"), OperationKind::Download)
        .await
        .unwrap();
    assert_eq!(attempts, 2);

    // Exhausted: skipped without touching the remote or the counter
    h.remote.reset_counts();
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.remote.counts.downloads(), 0);
    let attempts = h
        .store
        .retry_count(&rel("poison.txt"), OperationKind::Download)
        .await
        .unwrap();
    assert_eq!(attempts, 2);

    assert_eq!(h.read("fine.txt").unwrap(), b"f");
    assert!(!h.exists("poison.txt"));
    assert!(!h.exists(".poison.txt.docsync-part"));
}

#[tokio::test]
async fn test_success_resets_retry_counter() {
    let h = Harness::new().await;
    h.remote.add_document("/team/flaky.txt", b"ok");
    h.remote.inject(
        "get_content",
        Some("/team/flaky.txt"),
        RemoteError::NotFound("transient listing race".into()),
        Some(1),
    );

    assert!(!h.crawl().crawl_root().await.unwrap());
    assert!(h.crawl().crawl_root().await.unwrap());

    let attempts = h
        .store
        .retry_count(&rel("flaky.txt"), OperationKind::Download)
        .await
        .unwrap();
    assert_eq!(attempts, 0);
    assert_eq!(h.read("flaky.txt").unwrap(), b"ok");
}

#[tokio::test]
async fn test_connection_failure_aborts_the_crawl() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"X");
    h.remote.inject("get_children", None, RemoteError::Connection("refused".into()), None);

    let err = h.crawl().crawl_root().await.unwrap_err();
    assert!(matches!(err, docsync_sync::SyncError::Systemic(_)));
    assert!(!h.exists("doc.txt"));
}

#[tokio::test]
async fn test_checked_out_document_notifies_without_counting() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("doc.txt", b"local edit");
    h.remote.check_out("/team/doc.txt", Some("bob"));
    assert!(!h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"v1");
    assert_eq!(OpCounts::get(&h.remote.counts.set_content), 0);
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NoticeKind::CheckedOut);
    assert!(sent[0].body.contains("bob"));
    let attempts = h
        .store
        .retry_count(&rel("doc.txt"), OperationKind::Upload)
        .await
        .unwrap();
    assert_eq!(attempts, 0);

    // Checked in again: the edit goes through
    h.remote.check_out("/team/doc.txt", None);
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"local edit");
}

#[tokio::test]
async fn test_document_checked_out_by_ourselves_is_updated() {
    let h = Harness::new().await;
    h.remote.add_document("/team/doc.txt", b"v1");
    assert!(h.crawl().crawl_root().await.unwrap());

    h.write("doc.txt", b"mine");
    h.remote.check_out("/team/doc.txt", Some("alice"));
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.remote.content("/team/doc.txt").unwrap(), b"mine");
}

#[tokio::test]
async fn test_read_only_document_is_installed_read_only() {
    let h = Harness::new().await;
    h.remote.add_document("/team/locked.txt", b"frozen");
    h.remote.set_writable("/team/locked.txt", false);

    assert!(h.crawl().crawl_root().await.unwrap());

    let meta = std::fs::metadata(h.path("locked.txt")).unwrap();
    assert!(meta.permissions().readonly());
}

#[tokio::test]
async fn test_unrepresentable_remote_name_is_skipped() {
    let h = Harness::new().await;
    h.remote.add_document("/team/bad\u{7}name.txt", b"x");
    h.remote.add_document("/team/good.txt", b"y");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.list(""), vec!["good.txt"]);
    assert_eq!(h.remote.counts.downloads(), 1);
}

#[tokio::test]
async fn test_case_duplicates_keep_first_seen() {
    let h = Harness::with_repo(|repo| repo.ignore_case_duplicates = true).await;
    h.remote.add_document("/team/Doc.txt", b"upper");
    h.remote.add_document("/team/doc.txt", b"lower");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert_eq!(h.list(""), vec!["Doc.txt"]);
    assert_eq!(h.read("Doc.txt").unwrap(), b"upper");
}

// ============================================================================
// Filtering and modes
// ============================================================================

#[tokio::test]
async fn test_junk_and_ignored_paths_are_not_uploaded() {
    let h = Harness::with_repo(|repo| repo.ignored_paths = vec!["build".into()]).await;
    h.write("~$report.docx", b"lock");
    h.write(".git/config", b"[core]");
    h.write("notes.txt.swp", b"swap");
    h.write("build/out.bin", b"bin");
    h.write("real.txt", b"real");

    assert!(h.crawl().crawl_root().await.unwrap());

    assert!(h.remote.exists("/team/real.txt"));
    assert!(!h.remote.exists("/team/~$report.docx"));
    assert!(!h.remote.exists("/team/.git"));
    assert!(!h.remote.exists("/team/notes.txt.swp"));
    assert!(!h.remote.exists("/team/build"));
    assert_eq!(OpCounts::get(&h.remote.counts.create_document), 1);
}

#[tokio::test]
async fn test_download_only_never_pushes() {
    let h = Harness::with_repo(|repo| repo.mode = SyncMode::DownloadOnly).await;
    h.remote.add_document("/team/doc.txt", b"v1");
    h.write("local-only.txt", b"stays here");

    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.read("doc.txt").unwrap(), b"v1");
    assert!(h.exists("local-only.txt"));

    // A deleted mirror copy comes back instead of being deleted remotely
    h.delete("doc.txt");
    assert!(h.crawl().crawl_root().await.unwrap());
    assert_eq!(h.read("doc.txt").unwrap(), b"v1");
    assert_eq!(h.remote.counts.writes(), 0);
}
