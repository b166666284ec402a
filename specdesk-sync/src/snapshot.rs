//! Per-project snapshot cache: the last known content of every document.
//!
//! The store is the diff baseline for the watcher and is never durable;
//! the filesystem is the source of truth and a restart simply starts empty.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::etag::ETag;

/// Last known state of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
    pub relative_path: String,
    pub content: String,
    pub etag: ETag,
    pub size: usize,
    pub captured_at: SystemTime,
    /// Content replaced by a write that the watcher has not announced yet.
    /// Empty for a document the write created.
    pub written_over: Option<String>,
}

impl FileSnapshot {
    /// Capture `content`, deriving the etag from it.
    pub fn capture(relative_path: impl Into<String>, content: String) -> Self {
        let etag = ETag::compute(&content);
        Self::with_etag(relative_path, content, etag)
    }

    fn with_etag(relative_path: impl Into<String>, content: String, etag: ETag) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: content.len(),
            content,
            etag,
            captured_at: SystemTime::now(),
            written_over: None,
        }
    }
}

/// Map of relative path to [`FileSnapshot`].
///
/// Entries are replaced whole; there is no partial update.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    entries: HashMap<String, FileSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&FileSnapshot> {
        self.entries.get(path)
    }

    /// Replace the entry for `path`.
    ///
    /// `etag` must be the etag of `content`.
    pub fn set(&mut self, path: &str, content: String, etag: ETag) -> &FileSnapshot {
        debug_assert!(etag.matches(&content), "snapshot etag must hash its content");
        let snapshot = FileSnapshot::with_etag(path, content, etag);
        self.entries.insert(path.to_string(), snapshot);
        &self.entries[path]
    }

    /// Replace the entry for `path` after a write, remembering what the
    /// write replaced. Successive writes keep the oldest unannounced content.
    pub fn record_write(&mut self, path: &str, content: String, etag: ETag) -> &FileSnapshot {
        let replaced = self
            .entries
            .remove(path)
            .map(|prev| prev.written_over.unwrap_or(prev.content))
            .unwrap_or_default();
        debug_assert!(etag.matches(&content), "snapshot etag must hash its content");
        let mut snapshot = FileSnapshot::with_etag(path, content, etag);
        snapshot.written_over = Some(replaced);
        self.entries.insert(path.to_string(), snapshot);
        &self.entries[path]
    }

    /// Content to diff the next announcement of `path` against.
    pub fn baseline(&self, path: &str) -> Option<&str> {
        self.entries
            .get(path)
            .map(|s| s.written_over.as_deref().unwrap_or(&s.content))
    }

    pub fn delete(&mut self, path: &str) -> Option<FileSnapshot> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
