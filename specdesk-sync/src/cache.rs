//! Client-side document cache.
//!
//! A bounded LRU of the documents a session has opened. Change events
//! update entries in place: full content replaces, a diff is replayed onto
//! the cached text. Patched text is only kept when it hashes to the
//! announced etag; anything else evicts the entry and marks the path for a
//! full refetch on its next open.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;

use crate::etag::ETag;
use crate::files::FilePayload;
use crate::patch::apply_patch;
use crate::protocol::{ChangeEvent, ChangeKind};

/// Default number of documents kept per project view.
pub const DEFAULT_CACHE_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
    pub content: String,
    pub etag: ETag,
    pub size: usize,
    pub is_large: bool,
}

impl From<FilePayload> for CachedDocument {
    fn from(file: FilePayload) -> Self {
        Self {
            content: file.content,
            etag: file.etag,
            size: file.size,
            is_large: file.is_large,
        }
    }
}

/// What [`ClientCache::apply_change`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Entry replaced with the event's full content.
    Replaced,
    /// Entry updated by applying the event's diff.
    Patched,
    /// The entry already had the announced etag.
    Unchanged,
    /// The diff did not apply; the path must be refetched.
    Evicted,
    /// The document was deleted.
    Removed,
    /// The path is not cached and nothing was stored.
    NotCached,
}

pub struct ClientCache {
    entries: LruCache<String, CachedDocument>,
    stale: HashSet<String>,
}

impl Default for ClientCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ClientCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            stale: HashSet::new(),
        }
    }

    /// Look up a document, refreshing its recency.
    pub fn get(&mut self, path: &str) -> Option<&CachedDocument> {
        self.entries.get(path)
    }

    /// Look up a document without touching recency.
    pub fn peek(&self, path: &str) -> Option<&CachedDocument> {
        self.entries.peek(path)
    }

    /// Store a freshly fetched document. Clears any refetch mark.
    pub fn insert(&mut self, path: &str, file: FilePayload) {
        self.stale.remove(path);
        if let Some((evicted, _)) = self.entries.push(path.to_string(), file.into()) {
            if evicted != path {
                debug!("Cache full, evicted {}", evicted);
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<CachedDocument> {
        self.stale.remove(path);
        self.entries.pop(path)
    }

    /// Drop the entry and require a refetch on next open.
    pub fn mark_stale(&mut self, path: &str) {
        self.entries.pop(path);
        self.stale.insert(path.to_string());
    }

    /// Whether the next open of `path` must go to the server.
    pub fn needs_refetch(&self, path: &str) -> bool {
        self.stale.contains(path) || !self.entries.contains(path)
    }

    pub fn is_stale(&self, path: &str) -> bool {
        self.stale.contains(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Mark every cached entry for refetch, e.g. after events may have
    /// been missed.
    pub fn mark_all_stale(&mut self) {
        let paths: Vec<String> = self.entries.iter().map(|(path, _)| path.clone()).collect();
        for path in paths {
            self.mark_stale(&path);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stale.clear();
    }

    /// Reconcile one change notification with the cache.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> CacheUpdate {
        let path = event.path.as_str();

        if event.event == ChangeKind::Removed {
            let was_stale = self.stale.remove(path);
            return match self.entries.pop(path) {
                Some(_) => CacheUpdate::Removed,
                None if was_stale => CacheUpdate::Removed,
                None => CacheUpdate::NotCached,
            };
        }

        let Some(etag) = event.etag.as_ref() else {
            // An update without an etag cannot be verified.
            return self.evict(path);
        };

        // Our own write echoed back, or a repeat of the last event.
        if self.entries.peek(path).is_some_and(|doc| doc.etag == *etag) {
            return CacheUpdate::Unchanged;
        }

        if let Some(content) = event.content.as_ref() {
            if !self.entries.contains(path) && !self.stale.contains(path) {
                return CacheUpdate::NotCached;
            }
            let doc = CachedDocument {
                content: content.clone(),
                etag: etag.clone(),
                size: event.size.unwrap_or(content.len()),
                is_large: event.is_large.unwrap_or(false),
            };
            self.stale.remove(path);
            match self.entries.peek_mut(path) {
                Some(entry) => *entry = doc,
                None => {
                    self.entries.push(path.to_string(), doc);
                }
            }
            return CacheUpdate::Replaced;
        }

        let Some(doc) = self.entries.peek_mut(path) else {
            return CacheUpdate::NotCached;
        };
        let patched = match event.diff.as_deref() {
            Some(diff) => match apply_patch(&doc.content, diff) {
                Ok(content) => Some(content),
                Err(e) => {
                    debug!("Patch for {} failed: {}", path, e);
                    None
                }
            },
            None => None,
        };
        match patched {
            Some(content) if etag.matches(&content) => {
                doc.size = content.len();
                doc.content = content;
                doc.etag = etag.clone();
                if let Some(is_large) = event.is_large {
                    doc.is_large = is_large;
                }
                CacheUpdate::Patched
            }
            _ => self.evict(path),
        }
    }

    fn evict(&mut self, path: &str) -> CacheUpdate {
        debug!("Evicting {} for refetch", path);
        self.mark_stale(path);
        CacheUpdate::Evicted
    }
}
