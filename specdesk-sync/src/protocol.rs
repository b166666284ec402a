//! JSON wire protocol between editor sessions and the sync server.
//!
//! One WebSocket text frame carries one message. Every message is an object
//! with a `type` discriminator and camelCase fields:
//! ```text
//! client ── subscribe {projectPath} ───────────────► server
//!        ── read | write | resolve {id, ...} ──────►
//!        ◄── subscribed | file | conflict | error ──
//!        ◄── openspec-change {projectPath, path, event, diff?, etag?, ...}
//! ```
//!
//! Requests carry a client-chosen `id` echoed by the reply. Change
//! notifications are pushed between replies and carry no id.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::etag::ETag;
use crate::files::FilePayload;

/// Kind of filesystem change, named as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "add")]
    Added,
    #[serde(rename = "change")]
    Modified,
    #[serde(rename = "unlink")]
    Removed,
}

/// A settled change to one document, as announced to every subscriber.
///
/// `content` is present only when `is_large` is false. Removals carry
/// neither diff nor metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub project_path: String,
    pub path: String,
    pub event: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_large: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChangeEvent {
    /// An added or modified document. Content is dropped when `is_large`.
    pub fn updated(
        project_path: impl Into<String>,
        path: impl Into<String>,
        kind: ChangeKind,
        diff: String,
        file: FilePayload,
    ) -> Self {
        let FilePayload {
            content,
            etag,
            size,
            is_large,
        } = file;
        Self {
            project_path: project_path.into(),
            path: path.into(),
            event: kind,
            diff: Some(diff),
            etag: Some(etag),
            size: Some(size),
            is_large: Some(is_large),
            content: (!is_large).then_some(content),
        }
    }

    pub fn removed(project_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            path: path.into(),
            event: ChangeKind::Removed,
            diff: None,
            etag: None,
            size: None,
            is_large: None,
            content: None,
        }
    }
}

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Local,
    Remote,
    Merge,
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        project_path: String,
    },
    Read {
        id: u64,
        path: String,
    },
    Write {
        id: u64,
        path: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        etag: Option<ETag>,
    },
    Resolve {
        id: u64,
        path: String,
        resolution: ResolutionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Ping,
}

/// Category of an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    InvalidRequest,
    NotSubscribed,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not-found",
            Self::InvalidRequest => "invalid-request",
            Self::NotSubscribed => "not-subscribed",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Subscribed {
        project_path: String,
    },
    File {
        id: u64,
        file: FilePayload,
    },
    /// The write was rejected; `current` is what is on disk now.
    Conflict {
        id: u64,
        conflict: bool,
        current: String,
        etag: ETag,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    #[serde(rename = "openspec-change")]
    Change(ChangeEvent),
    Pong,
}

impl ServerMessage {
    /// The request id this message answers, if it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::File { id, .. } | Self::Conflict { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::Subscribed { .. } | Self::Change(_) | Self::Pong => None,
        }
    }

    pub fn error(id: Option<u64>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            kind,
            message: message.into(),
        }
    }
}

/// Serialize a message into one text frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Parse one text frame.
pub fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("unexpected response to request {0}")]
    UnexpectedResponse(u64),
}
