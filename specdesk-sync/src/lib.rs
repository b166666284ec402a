//! # specdesk-sync: File synchronization for project documents
//!
//! Keeps editor views of a project's `openspec/` documents in step with the
//! disk. Writes carry the etag they were based on and are rejected when the
//! document moved on; external edits are picked up by a debounced watcher
//! and pushed to every subscriber as unified diffs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │
//! │ + ClientCache│     JSON frames    │              │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐      ┌──────────┐
//! │ EditorSession│                    │ProjectContext│ ◄─── │ Watcher  │
//! │ (conflicts)  │                    │ FileAccess   │      │ (notify) │
//! └──────────────┘                    │ Snapshots    │      └──────────┘
//!                                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`files`]: Etag-checked reads, writes and conflict resolution
//! - [`snapshot`]: Last known content per document, the diff baseline
//! - [`broadcast`]: Per-project change event fan-out
//! - [`project`]: Project registry, one watcher per project
//! - [`server`] / [`client`]: WebSocket transport with reconnect
//! - [`cache`] / [`session`]: Client-side LRU cache and conflict records

pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod etag;
pub mod files;
pub mod guard;
pub mod patch;
pub mod project;
pub mod protocol;
pub mod server;
pub mod session;
pub mod snapshot;
mod watcher;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Subscription, SubscriptionHandle};
pub use cache::{CacheUpdate, CachedDocument, ClientCache};
pub use client::{BackoffPolicy, ClientConfig, ClientEvent, ConnectionState, SyncClient};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use etag::ETag;
pub use files::{FileAccess, FilePayload, Resolution, WriteConflict, WriteOutcome};
pub use guard::{ExtensionGuard, GuardError, PathGuard};
pub use project::{ProjectContext, ProjectId, ProjectManager};
pub use protocol::{ChangeEvent, ChangeKind, ClientMessage, ProtocolError, ServerMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ConflictChoice, ConflictRecord, DocumentApi, EditorSession, SaveOutcome};
pub use snapshot::{FileSnapshot, SnapshotStore};
