//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── FileAccess ── disk
//!             ├── ProjectContext ──┤                  │
//! Client B ──┘    (per root)       └── BroadcastGroup ◄── Watcher
//!                                         │
//!                              ┌──────────┼───────────┐
//!                              ▼          ▼           ▼
//!                           Client A   Client B    Client C
//! ```
//!
//! A connection subscribes to one project, then issues read, write and
//! resolve requests against it. Requests are answered in arrival order;
//! change notifications from the project are interleaved between replies.
//! Writes are never broadcast from here: every subscriber, the writer
//! included, learns about them from the watcher.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Subscription;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::files::{Resolution, WriteOutcome};
use crate::guard::{ExtensionGuard, GuardedPath, PathGuard};
use crate::project::{ProjectContext, ProjectManager};
use crate::protocol::{ClientMessage, ErrorKind, ServerMessage, decode, encode};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Settings applied to every project the server opens
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and short debounce, for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            sync: SyncConfig::for_testing(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub notifications_sent: u64,
    /// Change events lost by lagging subscribers, across all projects.
    pub events_dropped: u64,
    pub active_projects: usize,
}

/// Per-connection state.
#[derive(Default)]
struct Connection {
    project: Option<Arc<ProjectContext>>,
    subscription: Option<Subscription>,
}

/// Shared handles every connection task needs.
#[derive(Clone)]
struct Shared {
    projects: Arc<ProjectManager>,
    guard: Arc<dyn PathGuard>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let projects = Arc::new(ProjectManager::new(config.sync.clone()));
        Self {
            config,
            shared: Shared {
                projects,
                guard: Arc::new(ExtensionGuard::default()),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                shutdown: Arc::new(watch::channel(false).0),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Replace the default [`ExtensionGuard`].
    pub fn with_guard(mut self, guard: impl PathGuard + 'static) -> Self {
        self.shared.guard = Arc::new(guard);
        self
    }

    pub async fn bind(&self) -> SyncResult<TcpListener> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind the configured address and serve until an accept fails or
    /// [`SyncServer::shutdown`] is called.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let mut stop = self.shared.shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = stopped(&mut stop) => {
                    log::info!("Sync server stopped accepting");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();

        log::info!("WebSocket connection {conn_id} established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::default();
        let mut stop = shared.shutdown.subscribe();
        let result = async {
            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => {
                        log::info!("Closing connection {conn_id} for shutdown");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }

                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                shared.stats.write().await.total_messages += 1;
                                let reply = match decode::<ClientMessage>(text.as_str()) {
                                    Ok(request) => handle_request(request, &mut conn, &shared).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message on {conn_id}: {e}");
                                        Some(ServerMessage::error(None, ErrorKind::InvalidRequest, e.to_string()))
                                    }
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Text(encode(&reply)?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let reply = ServerMessage::error(
                                    None,
                                    ErrorKind::InvalidRequest,
                                    "binary frames are not supported",
                                );
                                ws_sender.send(Message::Text(encode(&reply)?.into())).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn_id} closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error on {conn_id}: {e}");
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }

                    event = async {
                        match conn.subscription.as_mut() {
                            Some(subscription) => subscription.recv().await,
                            // Not subscribed yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Some(event) => {
                                let msg = ServerMessage::Change(event.as_ref().clone());
                                ws_sender.send(Message::Text(encode(&msg)?.into())).await?;
                                shared.stats.write().await.notifications_sent += 1;
                            }
                            None => {
                                log::debug!("Project for {conn_id} was released");
                                conn.subscription = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        shared.stats.write().await.active_connections -= 1;
        result
    }

    /// Stop accepting and close every open connection. Clients see a
    /// dropped connection and start reconnecting.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        let contexts = self.shared.projects.contexts().await;
        stats.active_projects = contexts.len();
        stats.events_dropped = contexts
            .iter()
            .map(|p| p.broadcast_stats().events_dropped)
            .sum();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn projects(&self) -> &Arc<ProjectManager> {
        &self.shared.projects
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Answer one request. `None` means no reply is due.
async fn handle_request(request: ClientMessage, conn: &mut Connection, shared: &Shared) -> Option<ServerMessage> {
    match request {
        ClientMessage::Subscribe { project_path } => Some(subscribe(&project_path, conn, shared).await),

        ClientMessage::Read { id, path } => {
            let (project, guarded) = match target(conn, shared, id, &path) {
                Ok(target) => target,
                Err(reply) => return Some(reply),
            };
            Some(match project.read_file(&guarded.relative).await {
                Ok(file) => ServerMessage::File { id, file },
                Err(e) => error_reply(Some(id), &e),
            })
        }

        ClientMessage::Write {
            id,
            path,
            content,
            etag,
        } => {
            let (project, guarded) = match target(conn, shared, id, &path) {
                Ok(target) => target,
                Err(reply) => return Some(reply),
            };
            Some(
                match project.write_file(&guarded.relative, content, etag.as_ref()).await {
                    Ok(WriteOutcome::Written(file)) => ServerMessage::File { id, file },
                    Ok(WriteOutcome::Conflict(conflict)) => ServerMessage::Conflict {
                        id,
                        conflict: true,
                        current: conflict.current,
                        etag: conflict.etag,
                    },
                    Err(e) => error_reply(Some(id), &e),
                },
            )
        }

        ClientMessage::Resolve {
            id,
            path,
            resolution,
            content,
        } => {
            let (project, guarded) = match target(conn, shared, id, &path) {
                Ok(target) => target,
                Err(reply) => return Some(reply),
            };
            let Some(resolution) = Resolution::from_parts(resolution, content) else {
                return Some(ServerMessage::error(
                    Some(id),
                    ErrorKind::InvalidRequest,
                    "resolution requires content",
                ));
            };
            Some(match project.resolve_conflict(&guarded.relative, resolution).await {
                Ok(file) => ServerMessage::File { id, file },
                Err(e) => error_reply(Some(id), &e),
            })
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

async fn subscribe(project_path: &str, conn: &mut Connection, shared: &Shared) -> ServerMessage {
    let root = match shared.guard.resolve_project(project_path) {
        Ok(root) => root,
        Err(e) => return ServerMessage::error(None, ErrorKind::InvalidRequest, e.to_string()),
    };
    let project = match shared.projects.project(&root).await {
        Ok(project) => project,
        Err(e) => return error_reply(None, &e),
    };
    // Reads and writes still work without a watcher.
    if let Err(e) = project.ensure_watcher().await {
        log::warn!("Could not watch {}: {e}", project.id());
    }

    // Subscribe before replying so nothing after the reply is missed.
    conn.subscription = Some(project.subscribe());
    let reply = ServerMessage::Subscribed {
        project_path: project.id().to_string(),
    };
    log::info!("Connection subscribed to {}", project.id());
    conn.project = Some(project);
    reply
}

/// Resolve the subscribed project and a guarded path for a request.
fn target(
    conn: &Connection,
    shared: &Shared,
    id: u64,
    path: &str,
) -> Result<(Arc<ProjectContext>, GuardedPath), ServerMessage> {
    let project = conn.project.clone().ok_or_else(|| {
        ServerMessage::error(
            Some(id),
            ErrorKind::NotSubscribed,
            "subscribe to a project first",
        )
    })?;
    let guarded = shared
        .guard
        .resolve(project.base_dir(), path)
        .map_err(|e| ServerMessage::error(Some(id), ErrorKind::InvalidRequest, e.to_string()))?;
    Ok((project, guarded))
}

fn error_reply(id: Option<u64>, err: &SyncError) -> ServerMessage {
    let kind = match err {
        SyncError::NotFound { .. } | SyncError::ProjectNotFound { .. } => ErrorKind::NotFound,
        SyncError::Remote { kind, .. } => *kind,
        SyncError::Protocol(_) | SyncError::NoConflict { .. } => ErrorKind::InvalidRequest,
        SyncError::Io(_) | SyncError::Watch(_) => ErrorKind::Io,
    };
    ServerMessage::error(id, kind, err.to_string())
}
