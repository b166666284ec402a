//! Error types shared by the server and client halves of the crate.
//!
//! A rejected write is deliberately absent from this list: it is an ordinary
//! outcome and is reported through [`crate::files::WriteOutcome::Conflict`].

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::{ErrorKind, ProtocolError};

/// Result alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The document does not exist on disk.
    #[error("file not found: {path}")]
    NotFound { path: String },

    /// The project root handed to the manager does not exist.
    #[error("project path does not exist: {}", path.display())]
    ProjectNotFound { path: PathBuf },

    /// Disk failure. Surfaced as-is and never retried.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered a request with an error reply.
    #[error("server rejected request ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// A resolution was requested for a path with no pending conflict.
    #[error("no pending conflict for {path}")]
    NoConflict { path: String },
}

impl SyncError {
    /// Map a filesystem error, turning `NotFound` into the typed variant.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_string(),
            }
        } else {
            Self::Io(err)
        }
    }

    /// Whether this error means the document is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Remote {
                    kind: ErrorKind::NotFound,
                    ..
                }
        )
    }
}
