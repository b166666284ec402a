//! Document reads and writes with optimistic concurrency.
//!
//! A [`FileAccess`] borrows a project's snapshot store for the duration of
//! one operation. Holding it is what serialises document operations within
//! a project, so it is only ever obtained through
//! [`crate::project::ProjectContext::files`].
//!
//! Writes never notify subscribers. The watcher observes the write like any
//! other filesystem change and announces it from there.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::MutexGuard;

use crate::error::{SyncError, SyncResult};
use crate::etag::ETag;
use crate::patch::unified_diff;
use crate::protocol::ResolutionKind;
use crate::snapshot::SnapshotStore;

/// A document as returned to readers and writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub content: String,
    pub etag: ETag,
    pub size: usize,
    pub is_large: bool,
}

impl FilePayload {
    pub fn new(content: String, large_file_threshold: usize) -> Self {
        let etag = ETag::compute(&content);
        Self::with_etag(content, etag, large_file_threshold)
    }

    fn with_etag(content: String, etag: ETag, large_file_threshold: usize) -> Self {
        let size = content.len();
        Self {
            content,
            etag,
            size,
            is_large: size > large_file_threshold,
        }
    }
}

/// The disk content won over a write based on a stale etag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConflict {
    pub current: String,
    pub etag: ETag,
}

/// Result of [`FileAccess::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum WriteOutcome {
    Written(FilePayload),
    /// Nothing was written.
    Conflict(WriteConflict),
}

impl WriteOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// How to settle a rejected write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the disk with the local draft.
    Local(String),
    /// Drop the local draft and take the disk content.
    Remote,
    /// Overwrite the disk with content merged by the user.
    Merge(String),
}

impl Resolution {
    /// Build a resolution from its wire form.
    ///
    /// `local` and `merge` need content; `remote` ignores it.
    pub fn from_parts(kind: ResolutionKind, content: Option<String>) -> Option<Self> {
        match kind {
            ResolutionKind::Local => content.map(Self::Local),
            ResolutionKind::Merge => content.map(Self::Merge),
            ResolutionKind::Remote => Some(Self::Remote),
        }
    }

    pub fn kind(&self) -> ResolutionKind {
        match self {
            Self::Local(_) => ResolutionKind::Local,
            Self::Remote => ResolutionKind::Remote,
            Self::Merge(_) => ResolutionKind::Merge,
        }
    }

    /// Split into the wire form.
    pub fn into_parts(self) -> (ResolutionKind, Option<String>) {
        match self {
            Self::Local(content) => (ResolutionKind::Local, Some(content)),
            Self::Remote => (ResolutionKind::Remote, None),
            Self::Merge(content) => (ResolutionKind::Merge, Some(content)),
        }
    }
}

/// Exclusive access to one project's documents.
pub struct FileAccess<'a> {
    base_dir: &'a Path,
    large_file_threshold: usize,
    snapshots: MutexGuard<'a, SnapshotStore>,
}

impl<'a> FileAccess<'a> {
    pub(crate) fn new(
        base_dir: &'a Path,
        large_file_threshold: usize,
        snapshots: MutexGuard<'a, SnapshotStore>,
    ) -> Self {
        Self {
            base_dir,
            large_file_threshold,
            snapshots,
        }
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.base_dir.join(relative)
    }

    /// Read a document from disk and refresh its snapshot.
    pub async fn read(&mut self, relative: &str) -> SyncResult<FilePayload> {
        let content = tokio::fs::read_to_string(self.absolute(relative))
            .await
            .map_err(|e| SyncError::from_io(e, relative))?;
        Ok(self.record(relative, content))
    }

    /// Write `content` unless the document changed since `base` was read.
    ///
    /// `None` skips the check and overwrites unconditionally. A missing file
    /// is always created, whatever `base` says.
    pub async fn write(
        &mut self,
        relative: &str,
        content: String,
        base: Option<&ETag>,
    ) -> SyncResult<WriteOutcome> {
        let path = self.absolute(relative);

        if let Some(base) = base {
            match tokio::fs::read_to_string(&path).await {
                Ok(current) => {
                    let etag = ETag::compute(&current);
                    if etag != *base {
                        debug!("Write to {} rejected: base {} is stale", relative, base);
                        return Ok(WriteOutcome::Conflict(WriteConflict { current, etag }));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SyncError::Io(e)),
            }
        }

        self.persist(relative, &path, content)
            .await
            .map(WriteOutcome::Written)
    }

    /// Settle a conflict. Every resolution leaves disk and snapshot equal.
    pub async fn resolve(&mut self, relative: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        match resolution {
            Resolution::Remote => self.read(relative).await,
            Resolution::Local(content) | Resolution::Merge(content) => {
                let path = self.absolute(relative);
                self.persist(relative, &path, content).await
            }
        }
    }

    /// Diff the disk content against the snapshot and take the disk as the
    /// new baseline. `None` when the document does not exist.
    pub async fn diff_since_snapshot(&mut self, relative: &str) -> SyncResult<Option<String>> {
        let content = match tokio::fs::read_to_string(self.absolute(relative)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Io(e)),
        };
        let previous = self
            .snapshots
            .get(relative)
            .map(|s| s.content.as_str())
            .unwrap_or("");
        let diff = unified_diff(relative, previous, &content);
        self.record(relative, content);
        Ok(Some(diff))
    }

    async fn persist(&mut self, relative: &str, path: &Path, content: String) -> SyncResult<FilePayload> {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Could not create {}: {}", parent.display(), e);
            }
        }
        tokio::fs::write(path, content.as_bytes()).await?;
        debug!("Wrote {} ({} bytes)", relative, content.len());
        let etag = ETag::compute(&content);
        self.snapshots.record_write(relative, content.clone(), etag.clone());
        Ok(FilePayload::with_etag(content, etag, self.large_file_threshold))
    }

    fn record(&mut self, relative: &str, content: String) -> FilePayload {
        let etag = ETag::compute(&content);
        self.snapshots.set(relative, content.clone(), etag.clone());
        FilePayload::with_etag(content, etag, self.large_file_threshold)
    }
}
