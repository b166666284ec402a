//! Tunables shared by every project a process serves.

use std::path::PathBuf;
use std::time::Duration;

/// Files larger than this are announced by diff only (500 KiB).
pub const DEFAULT_LARGE_FILE_THRESHOLD: usize = 500 * 1024;

/// Stability window applied to bursts of raw filesystem events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Subdirectory of a project root holding the documents.
    /// An empty path means the project root itself.
    pub document_dir: PathBuf,
    /// Size in bytes above which change events omit the content.
    pub large_file_threshold: usize,
    /// Quiet period a path must observe before its change is settled.
    pub debounce: Duration,
    /// Change events buffered per receiver before it starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            document_dir: PathBuf::from("openspec"),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            debounce: DEFAULT_DEBOUNCE,
            broadcast_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Short debounce and small buffers, for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    pub fn with_document_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.document_dir = dir.into();
        self
    }

    pub fn with_large_file_threshold(mut self, bytes: usize) -> Self {
        self.large_file_threshold = bytes;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Whether a document of `size` bytes counts as large.
    pub fn is_large(&self, size: usize) -> bool {
        size > self.large_file_threshold
    }
}
