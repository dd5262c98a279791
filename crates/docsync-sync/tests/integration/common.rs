//! Shared test doubles for engine integration tests
//!
//! [`MemoryRemote`] is an in-memory remote repository keyed by absolute
//! remote path. Every mutation advances a logical clock by one second, so
//! server times are strictly increasing, and is appended to a change log.
//! Calls made through the [`IRemoteRepository`] trait are counted, and
//! failures can be injected per operation and target path.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use docsync_cache::DatabasePool;
use docsync_core::config::RepoInfo;
use docsync_core::domain::{
    ChangeRecord, ChangeSet, ChangeToken, DocumentMetadata, RelativePath, RemoteCapabilities,
    RemoteChange, RemoteChangeKind, RemoteDescendant, RemoteEntry, RemoteId, RemoteKind,
    RemotePath,
};
use docsync_core::ports::{
    ContentStream, IChangeStore, INotificationService, IRemoteConnector, IRemoteRepository,
    Notification, RemoteError,
};
use docsync_sync::{
    CrawlEngine, IncrementalEngine, LocalSweep, RetryPolicy, SyncContext, SyncControl, SyncFilter,
    SyncOrchestrator,
};

pub const USER: &str = "alice";
pub const REMOTE_ROOT: &str = "/team";

// ============================================================================
// MemoryRemote
// ============================================================================

#[derive(Debug, Clone)]
struct Node {
    id: RemoteId,
    folder: bool,
    content: Vec<u8>,
    modified: DateTime<Utc>,
    writable: bool,
    checked_out_by: Option<String>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    next_id: u64,
    clock: i64,
    log: Vec<RemoteChange>,
}

#[derive(Debug)]
struct Fault {
    op: &'static str,
    target: Option<String>,
    error: RemoteError,
    remaining: Option<u32>,
}

/// Number of calls per trait operation
#[derive(Debug, Default)]
pub struct OpCounts {
    pub get_children: AtomicUsize,
    pub get_descendants: AtomicUsize,
    pub get_entry: AtomicUsize,
    pub get_content: AtomicUsize,
    pub set_content: AtomicUsize,
    pub create_document: AtomicUsize,
    pub create_folder: AtomicUsize,
    pub delete: AtomicUsize,
    pub rename: AtomicUsize,
    pub move_object: AtomicUsize,
    pub get_changes: AtomicUsize,
}

impl OpCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Calls that modify the remote tree
    pub fn writes(&self) -> usize {
        [
            &self.set_content,
            &self.create_document,
            &self.create_folder,
            &self.delete,
            &self.rename,
            &self.move_object,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn downloads(&self) -> usize {
        self.get_content.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        for counter in [
            &self.get_children,
            &self.get_descendants,
            &self.get_entry,
            &self.get_content,
            &self.set_content,
            &self.create_document,
            &self.create_folder,
            &self.delete,
            &self.rename,
            &self.move_object,
            &self.get_changes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_below(path: &str, ancestor: &str) -> bool {
    path == ancestor || path.starts_with(&format!("{ancestor}/"))
}

impl Tree {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(self.clock)
    }

    fn new_id(&mut self, prefix: &str) -> RemoteId {
        self.next_id += 1;
        RemoteId::new(format!("{prefix}-{}", self.next_id)).unwrap()
    }

    fn path_of(&self, id: &RemoteId) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| &node.id == id)
            .map(|(path, _)| path.clone())
    }

    fn entry(&self, path: &str) -> Option<RemoteEntry> {
        let node = self.nodes.get(path)?;
        let kind = if node.folder {
            RemoteKind::Folder
        } else {
            RemoteKind::Document {
                size: node.content.len() as u64,
                writable: node.writable,
                checked_out_by: node.checked_out_by.clone(),
            }
        };
        Some(RemoteEntry {
            id: node.id.clone(),
            name: leaf(path).to_string(),
            last_modified: node.modified,
            kind,
        })
    }

    fn record(&mut self, id: RemoteId, kind: RemoteChangeKind, path: Option<&str>) {
        self.log.push(RemoteChange {
            id,
            kind,
            path: path.map(|p| RemotePath::new(p).unwrap()),
        });
    }

    fn insert(&mut self, path: &str, folder: bool, content: Vec<u8>) -> RemoteId {
        let id = self.new_id(if folder { "folder" } else { "doc" });
        let modified = self.tick();
        self.nodes.insert(
            path.to_string(),
            Node {
                id: id.clone(),
                folder,
                content,
                modified,
                writable: true,
                checked_out_by: None,
            },
        );
        self.record(id.clone(), RemoteChangeKind::Created, Some(path));
        id
    }

    fn remove_subtree(&mut self, path: &str) -> Vec<RemoteId> {
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| is_below(p, path))
            .cloned()
            .collect();
        let mut ids = Vec::new();
        for p in doomed {
            if let Some(node) = self.nodes.remove(&p) {
                ids.push(node.id.clone());
                self.record(node.id, RemoteChangeKind::Deleted, None);
            }
        }
        ids
    }

    fn move_subtree(&mut self, from: &str, to: &str) {
        let moving: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| is_below(p, from))
            .cloned()
            .collect();
        for p in moving {
            if let Some(node) = self.nodes.remove(&p) {
                let new_path = format!("{to}{}", &p[from.len()..]);
                self.nodes.insert(new_path, node);
            }
        }
        let modified = self.tick();
        if let Some(node) = self.nodes.get_mut(to) {
            node.modified = modified;
            let id = node.id.clone();
            self.record(id, RemoteChangeKind::Updated, Some(to));
        }
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|p| p != path && is_below(p, path))
    }

    fn require_folder(&self, path: &str) -> Result<()> {
        match self.nodes.get(path) {
            Some(node) if node.folder => Ok(()),
            Some(_) => Err(RemoteError::InvalidArgument(format!("{path} is not a folder")).into()),
            None => Err(RemoteError::NotFound(path.to_string()).into()),
        }
    }
}

/// In-memory remote repository
#[derive(Debug)]
pub struct MemoryRemote {
    tree: Mutex<Tree>,
    faults: Mutex<Vec<Fault>>,
    capabilities: RemoteCapabilities,
    pub counts: OpCounts,
}

impl MemoryRemote {
    /// Repository holding the (empty) folder `root` and its ancestors
    pub fn new(root: &str) -> Self {
        Self::with_capabilities(root, RemoteCapabilities::default())
    }

    pub fn with_capabilities(root: &str, capabilities: RemoteCapabilities) -> Self {
        let mut tree = Tree::default();
        let mut path = String::new();
        for component in root.split('/').filter(|c| !c.is_empty()) {
            path = child_path(if path.is_empty() { "/" } else { &path }, component);
            tree.insert(&path, true, Vec::new());
        }
        tree.log.clear();
        Self {
            tree: Mutex::new(tree),
            faults: Mutex::new(Vec::new()),
            capabilities,
            counts: OpCounts::default(),
        }
    }

    fn tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap()
    }

    // -- Server-side helpers (not counted) ------------------------------

    pub fn add_folder(&self, path: &str) -> RemoteId {
        self.tree().insert(path, true, Vec::new())
    }

    pub fn add_document(&self, path: &str, content: &[u8]) -> RemoteId {
        self.tree().insert(path, false, content.to_vec())
    }

    /// Replace the content of a document, as another client would
    pub fn update_document(&self, path: &str, content: &[u8]) {
        let mut tree = self.tree();
        let modified = tree.tick();
        let node = tree.nodes.get_mut(path).unwrap();
        node.content = content.to_vec();
        node.modified = modified;
        let id = node.id.clone();
        tree.record(id, RemoteChangeKind::Updated, Some(path));
    }

    pub fn remove(&self, path: &str) {
        self.tree().remove_subtree(path);
    }

    pub fn move_path(&self, from: &str, to: &str) {
        self.tree().move_subtree(from, to);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.tree()
            .nodes
            .get(path)
            .filter(|n| !n.folder)
            .map(|n| n.content.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(path)
    }

    pub fn is_folder(&self, path: &str) -> bool {
        self.tree().nodes.get(path).is_some_and(|n| n.folder)
    }

    pub fn id_of(&self, path: &str) -> Option<RemoteId> {
        self.tree().nodes.get(path).map(|n| n.id.clone())
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        self.tree().nodes.get(path).map(|n| n.modified)
    }

    pub fn set_writable(&self, path: &str, writable: bool) {
        self.tree().nodes.get_mut(path).unwrap().writable = writable;
    }

    pub fn check_out(&self, path: &str, holder: Option<&str>) {
        self.tree().nodes.get_mut(path).unwrap().checked_out_by = holder.map(str::to_string);
    }

    /// Make `op` fail with `error` (for `target` only, when given)
    ///
    /// `times` limits how often the fault fires; `None` means forever.
    pub fn inject(&self, op: &'static str, target: Option<&str>, error: RemoteError, times: Option<u32>) {
        self.faults.lock().unwrap().push(Fault {
            op,
            target: target.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn reset_counts(&self) {
        self.counts.reset();
    }

    fn check(&self, op: &'static str, target: Option<&str>) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        let hit = faults.iter_mut().find(|f| {
            f.op == op
                && f.remaining != Some(0)
                && f.target.as_deref().map_or(true, |t| Some(t) == target)
        });
        match hit {
            Some(fault) => {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                Err(fault.error.clone().into())
            }
            None => Ok(()),
        }
    }

    fn located(&self, id: &RemoteId) -> Result<String> {
        self.tree()
            .path_of(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()).into())
    }
}

async fn read_all(mut content: ContentStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    content.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait::async_trait]
impl IRemoteRepository for MemoryRemote {
    fn capabilities(&self) -> RemoteCapabilities {
        self.capabilities
    }

    async fn get_children(&self, folder: &RemotePath) -> Result<Vec<RemoteEntry>> {
        bump(&self.counts.get_children);
        self.check("get_children", Some(folder.as_str()))?;
        let tree = self.tree();
        tree.require_folder(folder.as_str())?;
        Ok(tree
            .nodes
            .keys()
            .filter(|p| p.as_str() != folder.as_str() && parent_path(p) == folder.as_str())
            .filter_map(|p| tree.entry(p))
            .collect())
    }

    async fn get_descendants(&self, folder: &RemotePath) -> Result<Vec<RemoteDescendant>> {
        bump(&self.counts.get_descendants);
        self.check("get_descendants", Some(folder.as_str()))?;
        let tree = self.tree();
        tree.require_folder(folder.as_str())?;
        let mut descendants = Vec::new();
        for path in tree.nodes.keys() {
            if path.as_str() == folder.as_str() || !is_below(path, folder.as_str()) {
                continue;
            }
            if let Some(entry) = tree.entry(path) {
                let parent = RemotePath::new(parent_path(path))?;
                descendants.push(RemoteDescendant { parent, entry });
            }
        }
        Ok(descendants)
    }

    async fn get_entry(&self, path: &RemotePath) -> Result<Option<RemoteEntry>> {
        bump(&self.counts.get_entry);
        self.check("get_entry", Some(path.as_str()))?;
        Ok(self.tree().entry(path.as_str()))
    }

    async fn get_content(&self, id: &RemoteId) -> Result<ContentStream> {
        bump(&self.counts.get_content);
        let path = self.located(id)?;
        self.check("get_content", Some(&path))?;
        let content = self.content(&path).ok_or_else(|| {
            RemoteError::InvalidArgument(format!("{path} is not a document"))
        })?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn set_content(
        &self,
        id: &RemoteId,
        content: ContentStream,
        _metadata: &DocumentMetadata,
    ) -> Result<RemoteEntry> {
        bump(&self.counts.set_content);
        let bytes = read_all(content).await?;
        let path = self.located(id)?;
        self.check("set_content", Some(&path))?;

        let mut tree = self.tree();
        let modified = tree.tick();
        let node = tree.nodes.get_mut(&path).unwrap();
        if let Some(holder) = &node.checked_out_by {
            if holder != USER {
                return Err(RemoteError::CheckedOut { by: holder.clone() }.into());
            }
        }
        if !node.writable {
            return Err(RemoteError::PermissionDenied(path).into());
        }
        node.content = bytes;
        node.modified = modified;
        let id = node.id.clone();
        tree.record(id, RemoteChangeKind::Updated, Some(&path));
        Ok(tree.entry(&path).unwrap())
    }

    async fn create_document(
        &self,
        parent: &RemotePath,
        name: &str,
        content: ContentStream,
        _metadata: &DocumentMetadata,
    ) -> Result<RemoteEntry> {
        bump(&self.counts.create_document);
        let bytes = read_all(content).await?;
        let path = child_path(parent.as_str(), name);
        self.check("create_document", Some(&path))?;

        let mut tree = self.tree();
        tree.require_folder(parent.as_str())?;
        if tree.nodes.contains_key(&path) {
            return Err(RemoteError::Constraint(format!("{path} already exists")).into());
        }
        tree.insert(&path, false, bytes);
        Ok(tree.entry(&path).unwrap())
    }

    async fn create_folder(&self, parent: &RemotePath, name: &str) -> Result<RemoteEntry> {
        bump(&self.counts.create_folder);
        let path = child_path(parent.as_str(), name);
        self.check("create_folder", Some(&path))?;

        let mut tree = self.tree();
        tree.require_folder(parent.as_str())?;
        if tree.nodes.contains_key(&path) {
            return Err(RemoteError::Constraint(format!("{path} already exists")).into());
        }
        tree.insert(&path, true, Vec::new());
        Ok(tree.entry(&path).unwrap())
    }

    async fn delete(&self, id: &RemoteId, recursive: bool) -> Result<()> {
        bump(&self.counts.delete);
        let path = self.located(id)?;
        self.check("delete", Some(&path))?;

        let mut tree = self.tree();
        if !recursive && tree.has_children(&path) {
            return Err(RemoteError::Constraint(format!("{path} is not empty")).into());
        }
        tree.remove_subtree(&path);
        Ok(())
    }

    async fn rename(&self, id: &RemoteId, new_name: &str) -> Result<RemoteEntry> {
        bump(&self.counts.rename);
        let path = self.located(id)?;
        self.check("rename", Some(&path))?;

        let target = child_path(&parent_path(&path), new_name);
        let mut tree = self.tree();
        if tree.nodes.contains_key(&target) {
            return Err(RemoteError::Constraint(format!("{target} already exists")).into());
        }
        tree.move_subtree(&path, &target);
        Ok(tree.entry(&target).unwrap())
    }

    async fn move_object(&self, id: &RemoteId, from: &RemotePath, to: &RemotePath) -> Result<RemoteEntry> {
        bump(&self.counts.move_object);
        let path = self.located(id)?;
        self.check("move_object", Some(&path))?;

        if parent_path(&path) != from.as_str() {
            return Err(RemoteError::InvalidArgument(format!("{path} is not in {from}")).into());
        }
        let target = child_path(to.as_str(), leaf(&path));
        let mut tree = self.tree();
        tree.require_folder(to.as_str())?;
        if tree.nodes.contains_key(&target) {
            return Err(RemoteError::Constraint(format!("{target} already exists")).into());
        }
        tree.move_subtree(&path, &target);
        Ok(tree.entry(&target).unwrap())
    }

    async fn change_log_token(&self) -> Result<ChangeToken> {
        if !self.capabilities.change_log {
            return Err(RemoteError::NotSupported("change log".into()).into());
        }
        Ok(ChangeToken::new(self.tree().log.len().to_string())?)
    }

    async fn get_changes(&self, since: &ChangeToken) -> Result<ChangeSet> {
        bump(&self.counts.get_changes);
        if !self.capabilities.change_log {
            return Err(RemoteError::NotSupported("change log".into()).into());
        }
        self.check("get_changes", None)?;
        let start: usize = since
            .as_str()
            .parse()
            .map_err(|_| RemoteError::InvalidArgument(format!("bad token {since:?}")))?;
        let tree = self.tree();
        let changes = tree.log.get(start..).unwrap_or_default().to_vec();
        Ok(ChangeSet {
            changes,
            latest_token: ChangeToken::new(tree.log.len().to_string())?,
        })
    }
}

// ============================================================================
// Connector and notifier
// ============================================================================

#[derive(Debug)]
pub struct MemoryConnector {
    remote: Arc<MemoryRemote>,
    pub connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(remote: Arc<MemoryRemote>) -> Self {
        Self {
            remote,
            connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl IRemoteConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn IRemoteRepository>> {
        bump(&self.connects);
        Ok(Arc::clone(&self.remote) as Arc<dyn IRemoteRepository>)
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl INotificationService for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// One folder pair: a temporary local root, a memory remote and a store
pub struct Harness {
    _dir: TempDir,
    pub repo: Arc<RepoInfo>,
    pub remote: Arc<MemoryRemote>,
    pub store: Arc<dyn IChangeStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub control: Arc<SyncControl>,
    _db: DatabasePool,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(MemoryRemote::new(REMOTE_ROOT), |_| {}).await
    }

    pub async fn with_repo(configure: impl FnOnce(&mut RepoInfo)) -> Self {
        Self::build(MemoryRemote::new(REMOTE_ROOT), configure).await
    }

    pub async fn build(remote: MemoryRemote, configure: impl FnOnce(&mut RepoInfo)) -> Self {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local");
        std::fs::create_dir(&local).unwrap();

        let mut repo = RepoInfo::new("team", local, RemotePath::new(REMOTE_ROOT).unwrap());
        repo.user = USER.to_string();
        configure(&mut repo);

        let db = DatabasePool::in_memory().await.unwrap();
        let store: Arc<dyn IChangeStore> = Arc::new(db.store("team"));

        Self {
            _dir: dir,
            repo: Arc::new(repo),
            remote: Arc::new(remote),
            store,
            notifier: Arc::new(RecordingNotifier::default()),
            control: Arc::new(SyncControl::default()),
            _db: db,
        }
    }

    pub fn root(&self) -> &Path {
        &self.repo.local_path
    }

    pub fn context(&self) -> Arc<SyncContext> {
        Arc::new(SyncContext {
            repo: Arc::clone(&self.repo),
            roots: Arc::new(self.repo.roots()),
            remote: Arc::clone(&self.remote) as Arc<dyn IRemoteRepository>,
            capabilities: self.remote.capabilities(),
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier) as Arc<dyn INotificationService>,
            control: Arc::clone(&self.control),
            filter: Arc::new(SyncFilter::new(&self.repo.ignored_paths).unwrap()),
            retry: RetryPolicy::none(),
        })
    }

    pub fn crawl(&self) -> CrawlEngine {
        CrawlEngine::new(self.context())
    }

    pub fn sweep(&self) -> LocalSweep {
        LocalSweep::new(self.context())
    }

    pub fn incremental(&self) -> IncrementalEngine {
        IncrementalEngine::new(self.context())
    }

    pub fn orchestrator(&self, connector: &Arc<MemoryConnector>) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::clone(&self.repo),
            Arc::clone(connector) as Arc<dyn IRemoteConnector>,
            Arc::clone(&self.store),
            Arc::clone(&self.notifier) as Arc<dyn INotificationService>,
            Arc::clone(&self.control),
            RetryPolicy::none(),
        )
        .unwrap()
    }

    // -- Local side -----------------------------------------------------

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn mkdir(&self, rel: &str) {
        std::fs::create_dir_all(self.path(rel)).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).symlink_metadata().is_ok()
    }

    pub fn delete(&self, rel: &str) {
        let path = self.path(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
    }

    /// Local names in `rel`, sorted
    pub fn list(&self, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(rel))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    // -- Remote side and store -------------------------------------------

    /// Absolute remote path of `rel`
    pub fn remote_path(rel: &str) -> String {
        if rel.is_empty() {
            REMOTE_ROOT.to_string()
        } else {
            format!("{REMOTE_ROOT}/{rel}")
        }
    }

    pub async fn record(&self, rel: &str) -> Option<ChangeRecord> {
        self.store
            .lookup(&RelativePath::new(rel).unwrap())
            .await
            .unwrap()
    }
}

pub fn rel(path: &str) -> RelativePath {
    RelativePath::new(path).unwrap()
}
