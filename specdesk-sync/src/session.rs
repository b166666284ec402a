//! Client-side reconciliation for one project view.
//!
//! An [`EditorSession`] ties a [`ClientCache`] to a [`DocumentApi`] and
//! keeps at most one [`ConflictRecord`] per document. A record is created
//! when a save is rejected and removed only once a resolution has been
//! accepted by the server, so a failed resolution leaves it in place for
//! another try.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{debug, info};

use crate::cache::{CacheUpdate, CachedDocument, ClientCache};
use crate::client::{ClientEvent, SyncClient};
use crate::error::{SyncError, SyncResult};
use crate::etag::ETag;
use crate::files::{FilePayload, Resolution, WriteOutcome};
use crate::patch::apply_patch;
use crate::project::ProjectContext;
use crate::protocol::{ChangeEvent, ChangeKind};

/// Document operations a session needs, remote or in-process.
pub trait DocumentApi: Send + Sync {
    fn read(&self, path: &str) -> impl Future<Output = SyncResult<FilePayload>> + Send;

    fn write(
        &self,
        path: &str,
        content: String,
        base: Option<&ETag>,
    ) -> impl Future<Output = SyncResult<WriteOutcome>> + Send;

    fn resolve(&self, path: &str, resolution: Resolution) -> impl Future<Output = SyncResult<FilePayload>> + Send;
}

impl DocumentApi for SyncClient {
    async fn read(&self, path: &str) -> SyncResult<FilePayload> {
        SyncClient::read(self, path).await
    }

    async fn write(&self, path: &str, content: String, base: Option<&ETag>) -> SyncResult<WriteOutcome> {
        SyncClient::write(self, path, content, base).await
    }

    async fn resolve(&self, path: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        SyncClient::resolve(self, path, resolution).await
    }
}

impl DocumentApi for ProjectContext {
    async fn read(&self, path: &str) -> SyncResult<FilePayload> {
        self.read_file(path).await
    }

    async fn write(&self, path: &str, content: String, base: Option<&ETag>) -> SyncResult<WriteOutcome> {
        self.write_file(path, content, base).await
    }

    async fn resolve(&self, path: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        self.resolve_conflict(path, resolution).await
    }
}

impl<T: DocumentApi> DocumentApi for Arc<T> {
    async fn read(&self, path: &str) -> SyncResult<FilePayload> {
        T::read(self, path).await
    }

    async fn write(&self, path: &str, content: String, base: Option<&ETag>) -> SyncResult<WriteOutcome> {
        T::write(self, path, content, base).await
    }

    async fn resolve(&self, path: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        T::resolve(self, path, resolution).await
    }
}

/// A rejected save awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub relative_path: String,
    /// Etag the rejected save was based on.
    pub base_etag: ETag,
    pub remote_content: String,
    pub remote_etag: ETag,
    pub local_draft: String,
}

/// The three ways out of a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    /// Content merged by the user.
    Merge(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(CachedDocument),
    Conflict(ConflictRecord),
}

pub struct EditorSession<A> {
    api: A,
    cache: ClientCache,
    /// Etag of the version last handed to the caller, per path. Outlives
    /// cache eviction so saves stay checked against what the user saw.
    bases: HashMap<String, ETag>,
    conflicts: HashMap<String, ConflictRecord>,
    current: Option<String>,
}

impl<A: DocumentApi> EditorSession<A> {
    pub fn new(api: A, cache_capacity: usize) -> Self {
        Self {
            api,
            cache: ClientCache::new(cache_capacity),
            bases: HashMap::new(),
            conflicts: HashMap::new(),
            current: None,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Path of the document currently shown, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Open a document, serving it from cache unless it must be refetched.
    ///
    /// The returned version becomes the base for the next save.
    pub async fn open(&mut self, path: &str) -> SyncResult<CachedDocument> {
        self.current = Some(path.to_string());
        let cached = if self.cache.needs_refetch(path) {
            None
        } else {
            self.cache.get(path).cloned()
        };
        let doc = match cached {
            Some(doc) => doc,
            None => self.fetch(path).await?,
        };
        self.bases.insert(path.to_string(), doc.etag.clone());
        Ok(doc)
    }

    /// Etag the next save of `path` will be checked against.
    pub fn base_etag(&self, path: &str) -> Option<&ETag> {
        self.bases.get(path)
    }

    pub fn close(&mut self) {
        self.current = None;
    }

    /// Save `content` based on the version last opened.
    ///
    /// A path never opened is saved as a new document and conflicts with
    /// any existing content. A rejection records a conflict instead of
    /// failing. Saving again while a conflict is pending only updates its
    /// local draft.
    pub async fn save(&mut self, path: &str, content: String) -> SyncResult<SaveOutcome> {
        if let Some(record) = self.conflicts.get_mut(path) {
            record.local_draft = content;
            return Ok(SaveOutcome::Conflict(record.clone()));
        }

        let base = self
            .bases
            .get(path)
            .cloned()
            .unwrap_or_else(|| ETag::compute(""));
        self.submit(path, content, Some(base)).await
    }

    /// Overwrite `path` without any etag check, dropping a pending
    /// conflict once the write lands.
    pub async fn force_save(&mut self, path: &str, content: String) -> SyncResult<SaveOutcome> {
        let outcome = self.submit(path, content, None).await?;
        if matches!(outcome, SaveOutcome::Saved(_)) {
            self.conflicts.remove(path);
        }
        Ok(outcome)
    }

    async fn submit(&mut self, path: &str, content: String, base: Option<ETag>) -> SyncResult<SaveOutcome> {
        match self.api.write(path, content.clone(), base.as_ref()).await? {
            WriteOutcome::Written(file) => Ok(SaveOutcome::Saved(self.adopt(path, file))),
            WriteOutcome::Conflict(conflict) => {
                info!("Save of {} conflicts with a newer version", path);
                let record = ConflictRecord {
                    relative_path: path.to_string(),
                    base_etag: base.unwrap_or_else(|| conflict.etag.clone()),
                    remote_content: conflict.current,
                    remote_etag: conflict.etag,
                    local_draft: content,
                };
                self.conflicts.insert(path.to_string(), record.clone());
                Ok(SaveOutcome::Conflict(record))
            }
        }
    }

    pub fn conflict(&self, path: &str) -> Option<&ConflictRecord> {
        self.conflicts.get(path)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Settle the pending conflict for `path`.
    pub async fn resolve(&mut self, path: &str, choice: ConflictChoice) -> SyncResult<CachedDocument> {
        let record = self.conflicts.get(path).ok_or_else(|| SyncError::NoConflict {
            path: path.to_string(),
        })?;
        let resolution = match choice {
            ConflictChoice::KeepLocal => Resolution::Local(record.local_draft.clone()),
            ConflictChoice::KeepRemote => Resolution::Remote,
            ConflictChoice::Merge(content) => Resolution::Merge(content),
        };

        let file = self.api.resolve(path, resolution).await?;
        self.conflicts.remove(path);
        Ok(self.adopt(path, file))
    }

    /// Apply a change notification to the cache and any pending conflict.
    ///
    /// Save bases do not move here, only on open, save and resolve.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> CacheUpdate {
        if let Some(record) = self.conflicts.get_mut(&event.path) {
            refresh_remote_side(record, event);
        }
        let update = self.cache.apply_change(event);
        debug!("{} {:?}: {:?}", event.path, event.event, update);
        update
    }

    /// React to one client event.
    ///
    /// Evictions of the open document and resumed connections both
    /// refetch it right away.
    pub async fn handle_client_event(&mut self, event: &ClientEvent) -> SyncResult<Option<CacheUpdate>> {
        match event {
            ClientEvent::Change(change) => {
                let update = self.apply_change(change);
                if update == CacheUpdate::Evicted && self.current.as_deref() == Some(change.path.as_str()) {
                    self.refetch_current().await?;
                }
                Ok(Some(update))
            }
            ClientEvent::Connected { resumed: true } => {
                // Events sent while we were away are gone.
                self.cache.mark_all_stale();
                self.refetch_current().await?;
                Ok(None)
            }
            ClientEvent::Connected { resumed: false }
            | ClientEvent::Disconnected
            | ClientEvent::ReconnectScheduled { .. } => Ok(None),
        }
    }

    /// Fetch the open document again. `None` if nothing is open or the
    /// document has been deleted.
    ///
    /// The save base is left alone: a draft typed before the refetch still
    /// conflicts. Call [`EditorSession::open`] to adopt the new version.
    pub async fn refetch_current(&mut self) -> SyncResult<Option<CachedDocument>> {
        let Some(path) = self.current.clone() else {
            return Ok(None);
        };
        match self.fetch(&path).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => {
                self.cache.remove(&path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cache a version the server accepted and make it the save base.
    fn adopt(&mut self, path: &str, file: FilePayload) -> CachedDocument {
        self.bases.insert(path.to_string(), file.etag.clone());
        self.cache.insert(path, file.clone());
        file.into()
    }

    async fn fetch(&mut self, path: &str) -> SyncResult<CachedDocument> {
        let file = self.api.read(path).await?;
        self.cache.insert(path, file.clone());
        Ok(file.into())
    }
}

impl EditorSession<SyncClient> {
    /// A session sized by the client's configured cache capacity.
    pub fn from_client(client: SyncClient) -> Self {
        let capacity = client.config().cache_capacity;
        Self::new(client, capacity)
    }
}

/// Keep a conflict's remote side in step with the disk.
fn refresh_remote_side(record: &mut ConflictRecord, event: &ChangeEvent) {
    if event.event == ChangeKind::Removed {
        return;
    }
    let Some(etag) = event.etag.as_ref() else {
        return;
    };
    if *etag == record.remote_etag {
        return;
    }
    let content = match (&event.content, &event.diff) {
        (Some(content), _) => Some(content.clone()),
        (None, Some(diff)) => apply_patch(&record.remote_content, diff)
            .ok()
            .filter(|patched| etag.matches(patched)),
        (None, None) => None,
    };
    if let Some(content) = content {
        record.remote_content = content;
        record.remote_etag = etag.clone();
    }
}
