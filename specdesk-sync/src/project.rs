//! Project registry: one context per project root.
//!
//! A [`ProjectContext`] owns the snapshot store, the broadcast group and at
//! most one watcher for a project. The [`ProjectManager`] creates contexts
//! on first reference and keeps them until [`ProjectManager::release`] is
//! called; nothing is torn down automatically.
//!
//! ```text
//! ProjectManager ──► ProjectContext ──► ProjectCore { snapshots, broadcast }
//!                          │                   ▲
//!                          └─► ProjectWatcher ─┘ (event loop holds the core)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{Mutex, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Subscription, SubscriptionHandle};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::etag::ETag;
use crate::files::{FileAccess, FilePayload, Resolution, WriteOutcome};
use crate::protocol::ChangeEvent;
use crate::snapshot::SnapshotStore;
use crate::watcher::ProjectWatcher;

/// Identity of a project: its canonicalised root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_root(root: &Path) -> Self {
        Self(root.to_string_lossy().into_owned())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State shared between a context and its watcher task.
pub(crate) struct ProjectCore {
    pub(crate) id: ProjectId,
    pub(crate) base_dir: PathBuf,
    pub(crate) config: SyncConfig,
    pub(crate) snapshots: Mutex<SnapshotStore>,
    pub(crate) broadcast: BroadcastGroup,
}

/// Everything the process knows about one project.
pub struct ProjectContext {
    root: PathBuf,
    core: Arc<ProjectCore>,
    watcher: Mutex<Option<ProjectWatcher>>,
}

impl ProjectContext {
    /// Create a context for an already canonical `root`.
    fn new(root: PathBuf, config: SyncConfig) -> Self {
        let base_dir = root.join(&config.document_dir);
        let core = ProjectCore {
            id: ProjectId::from_root(&root),
            base_dir,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            snapshots: Mutex::new(SnapshotStore::new()),
            config,
        };
        Self {
            root,
            core: Arc::new(core),
            watcher: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ProjectId {
        &self.core.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the project's relative document paths resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.core.base_dir
    }

    /// Exclusive access to the project's documents.
    ///
    /// Waits for any in-flight operation or watcher settle to finish.
    pub async fn files(&self) -> FileAccess<'_> {
        let snapshots = self.core.snapshots.lock().await;
        FileAccess::new(
            &self.core.base_dir,
            self.core.config.large_file_threshold,
            snapshots,
        )
    }

    pub async fn read_file(&self, relative: &str) -> SyncResult<FilePayload> {
        self.files().await.read(relative).await
    }

    pub async fn write_file(
        &self,
        relative: &str,
        content: String,
        base: Option<&ETag>,
    ) -> SyncResult<WriteOutcome> {
        self.files().await.write(relative, content, base).await
    }

    pub async fn resolve_conflict(&self, relative: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        self.files().await.resolve(relative, resolution).await
    }

    pub async fn diff_since_snapshot(&self, relative: &str) -> SyncResult<Option<String>> {
        self.files().await.diff_since_snapshot(relative).await
    }

    /// Start the watcher unless one is already running.
    ///
    /// Returns whether a watcher is running afterwards. A project without a
    /// document directory gets none; a later call may succeed once the
    /// directory exists.
    pub async fn ensure_watcher(&self) -> SyncResult<bool> {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            return Ok(true);
        }
        if !tokio::fs::metadata(&self.core.base_dir)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            debug!(
                "No document directory at {}, not watching",
                self.core.base_dir.display()
            );
            return Ok(false);
        }
        *watcher = Some(ProjectWatcher::start(Arc::clone(&self.core))?);
        Ok(true)
    }

    pub async fn is_watching(&self) -> bool {
        self.watcher.lock().await.is_some()
    }

    pub fn subscribe(&self) -> Subscription {
        self.core.broadcast.subscribe()
    }

    pub fn on_change_event<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: FnMut(Arc<ChangeEvent>) + Send + 'static,
    {
        self.core.broadcast.on_change_event(listener)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.core.broadcast.stats()
    }

    /// Number of documents with a snapshot.
    pub async fn snapshot_count(&self) -> usize {
        self.core.snapshots.lock().await.len()
    }

    /// Stop the watcher and forget every snapshot.
    async fn teardown(&self) {
        self.watcher.lock().await.take();
        self.core.snapshots.lock().await.clear();
    }
}

/// Maps project roots to their contexts.
pub struct ProjectManager {
    projects: RwLock<HashMap<ProjectId, Arc<ProjectContext>>>,
    config: SyncConfig,
}

impl ProjectManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get or create the context for `root`.
    ///
    /// Two spellings of the same directory resolve to the same context.
    pub async fn project(&self, root: impl AsRef<Path>) -> SyncResult<Arc<ProjectContext>> {
        let root = root.as_ref();
        let canonical = tokio::fs::canonicalize(root).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::ProjectNotFound {
                    path: root.to_path_buf(),
                }
            } else {
                SyncError::Io(e)
            }
        })?;
        let id = ProjectId::from_root(&canonical);

        // Fast path: read lock
        {
            let projects = self.projects.read().await;
            if let Some(project) = projects.get(&id) {
                return Ok(Arc::clone(project));
            }
        }

        let mut projects = self.projects.write().await;
        // Double-check after acquiring write lock
        if let Some(project) = projects.get(&id) {
            return Ok(Arc::clone(project));
        }

        info!("Opening project {}", id);
        let project = Arc::new(ProjectContext::new(canonical, self.config.clone()));
        projects.insert(id, Arc::clone(&project));
        Ok(project)
    }

    pub async fn read_file(&self, root: impl AsRef<Path>, relative: &str) -> SyncResult<FilePayload> {
        self.project(root).await?.read_file(relative).await
    }

    pub async fn write_file(
        &self,
        root: impl AsRef<Path>,
        relative: &str,
        content: String,
        base: Option<&ETag>,
    ) -> SyncResult<WriteOutcome> {
        self.project(root).await?.write_file(relative, content, base).await
    }

    pub async fn resolve_conflict(
        &self,
        root: impl AsRef<Path>,
        relative: &str,
        resolution: Resolution,
    ) -> SyncResult<FilePayload> {
        self.project(root).await?.resolve_conflict(relative, resolution).await
    }

    pub async fn diff_since_snapshot(&self, root: impl AsRef<Path>, relative: &str) -> SyncResult<Option<String>> {
        self.project(root).await?.diff_since_snapshot(relative).await
    }

    pub async fn ensure_watcher(&self, root: impl AsRef<Path>) -> SyncResult<bool> {
        self.project(root).await?.ensure_watcher().await
    }

    pub async fn on_change_event<F>(&self, root: impl AsRef<Path>, listener: F) -> SyncResult<SubscriptionHandle>
    where
        F: FnMut(Arc<ChangeEvent>) + Send + 'static,
    {
        Ok(self.project(root).await?.on_change_event(listener))
    }

    /// Drop a project's watcher and snapshots.
    ///
    /// Subscribers see their streams end once the last handle to the
    /// context is gone. Returns whether the project was open.
    pub async fn release(&self, id: &ProjectId) -> bool {
        let removed = self.projects.write().await.remove(id);
        match removed {
            Some(project) => {
                project.teardown().await;
                info!("Released project {}", id);
                true
            }
            None => false,
        }
    }

    pub async fn project_count(&self) -> usize {
        self.projects.read().await.len()
    }

    pub async fn active_projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.projects.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every open context, in no particular order.
    pub async fn contexts(&self) -> Vec<Arc<ProjectContext>> {
        self.projects.read().await.values().cloned().collect()
    }
}
