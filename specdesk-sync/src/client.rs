//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle with capped exponential-backoff reconnect
//! - Resubscribe to the same project after every reconnect
//! - Request/reply correlation for read, write and resolve
//! - A stream of [`ClientEvent`]s carrying connection changes and
//!   change notifications
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                    ▲                │ close / error
//!                    │                ▼
//!                    └─── ReconnectScheduled (delay = min(base·2ⁿ, cap))
//! ```
//!
//! Missed change events are never replayed. After a reconnect the
//! application refetches whatever it has open.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::{SyncError, SyncResult};
use crate::etag::ETag;
use crate::files::{FilePayload, Resolution, WriteConflict, WriteOutcome};
use crate::protocol::{ChangeEvent, ClientMessage, ProtocolError, ServerMessage, decode, encode};

/// Reconnect delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(15000),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, cap)`, saturating.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Failed attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established and subscription sent. `resumed` is true for
    /// every connection after the first.
    Connected { resumed: bool },
    /// Connection lost
    Disconnected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A document in the subscribed project changed
    Change(ChangeEvent),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the sync server, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Absolute project root to subscribe to
    pub project_path: String,
    pub backoff: BackoffPolicy,
    /// Documents kept by an [`crate::session::EditorSession`]
    pub cache_capacity: usize,
    /// How long a request waits for its reply
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, project_path: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            project_path: project_path.into(),
            backoff: BackoffPolicy::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = BackoffPolicy { base, cap };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// State shared between the client handle and its connection task.
#[derive(Default)]
struct ClientShared {
    /// Writer channel of the live connection, if any
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Requests awaiting a reply, by id
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    /// Project identity reported by the server
    project_id: RwLock<Option<String>>,
}

/// The sync client.
///
/// Connects on construction and keeps reconnecting until
/// [`SyncClient::disconnect`] is called or the client is dropped.
pub struct SyncClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    next_id: AtomicU64,
    state_rx: watch::Receiver<ConnectionState>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Start the connection manager. Must be called within a tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = ConnectionManager {
            config: config.clone(),
            shared: Arc::clone(&shared),
            state_tx,
            event_tx,
            shutdown_rx,
        };
        let task = tokio::spawn(manager.run());

        Self {
            config,
            shared,
            next_id: AtomicU64::new(1),
            state_rx,
            event_rx: Some(event_rx),
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> SyncResult<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Protocol(ProtocolError::ConnectionClosed))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Project identity the server acknowledged, once subscribed.
    pub async fn project_id(&self) -> Option<String> {
        self.shared.project_id.read().await.clone()
    }

    pub async fn read(&self, path: &str) -> SyncResult<FilePayload> {
        let path = path.to_string();
        match self.request(|id| ClientMessage::Read { id, path }).await? {
            ServerMessage::File { file, .. } => Ok(file),
            other => Err(unexpected(other)),
        }
    }

    /// Write with optimistic concurrency; see [`crate::files::FileAccess::write`].
    pub async fn write(&self, path: &str, content: String, base: Option<&ETag>) -> SyncResult<WriteOutcome> {
        let path = path.to_string();
        let etag = base.cloned();
        let reply = self
            .request(|id| ClientMessage::Write {
                id,
                path,
                content,
                etag,
            })
            .await?;
        match reply {
            ServerMessage::File { file, .. } => Ok(WriteOutcome::Written(file)),
            ServerMessage::Conflict { current, etag, .. } => Ok(WriteOutcome::Conflict(WriteConflict { current, etag })),
            other => Err(unexpected(other)),
        }
    }

    pub async fn resolve(&self, path: &str, resolution: Resolution) -> SyncResult<FilePayload> {
        let path = path.to_string();
        let (resolution, content) = resolution.into_parts();
        let reply = self
            .request(|id| ClientMessage::Resolve {
                id,
                path,
                resolution,
                content,
            })
            .await?;
        match reply {
            ServerMessage::File { file, .. } => Ok(file),
            other => Err(unexpected(other)),
        }
    }

    /// Send a ping to the server. The pong is not awaited.
    pub async fn send_ping(&self) -> SyncResult<()> {
        self.send(encode(&ClientMessage::Ping)?).await
    }

    /// Stop reconnecting and close the connection.
    pub async fn disconnect(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn send(&self, text: String) -> SyncResult<()> {
        let outgoing = self.shared.outgoing.lock().await;
        outgoing
            .as_ref()
            .and_then(|tx| tx.send(text).ok())
            .ok_or(SyncError::Protocol(ProtocolError::ConnectionClosed))
    }

    /// Send a request and wait for the reply carrying its id.
    ///
    /// Error replies come back as [`SyncError::Remote`].
    async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> SyncResult<ServerMessage> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = encode(&build(id))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);
        if let Err(e) = self.send(text).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped: the connection went away.
            Ok(Err(_)) => return Err(SyncError::Protocol(ProtocolError::ConnectionClosed)),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                return Err(SyncError::Protocol(ProtocolError::Timeout));
            }
        };
        match reply {
            ServerMessage::Error { kind, message, .. } => Err(SyncError::Remote { kind, message }),
            reply => Ok(reply),
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn unexpected(reply: ServerMessage) -> SyncError {
    SyncError::Protocol(ProtocolError::UnexpectedResponse(reply.request_id().unwrap_or(0)))
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Background task owning the socket.
struct ConnectionManager {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

/// How a connection cycle ended.
enum CycleEnd {
    Lost,
    Shutdown,
}

impl ConnectionManager {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff);
        let mut connected_before = false;

        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);
            match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
                Ok((ws_stream, _)) => {
                    backoff.reset();
                    let end = self.drive(ws_stream, connected_before).await;
                    connected_before = true;

                    self.shared.outgoing.lock().await.take();
                    // Dropping the senders fails every waiting request.
                    self.shared.pending.lock().await.clear();
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    let _ = self.event_tx.send(ClientEvent::Disconnected);
                    if matches!(end, CycleEnd::Shutdown) {
                        return;
                    }
                    info!("Connection to {} lost", self.config.server_url);
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.config.server_url, e);
                }
            }
            if *self.shutdown_rx.borrow() {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }

            let attempt = backoff.attempt() + 1;
            let delay = backoff.next_delay();
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
            self.state_tx.send_replace(ConnectionState::ReconnectScheduled);
            let _ = self.event_tx.send(ClientEvent::ReconnectScheduled { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Run one connection until it drops or shutdown is requested.
    async fn drive(&mut self, ws_stream: WsStream, resumed: bool) -> CycleEnd {
        let (mut writer, mut reader) = ws_stream.split();

        let subscribe = ClientMessage::Subscribe {
            project_path: self.config.project_path.clone(),
        };
        let sent = match encode(&subscribe) {
            Ok(text) => writer.send(Message::Text(text.into())).await.is_ok(),
            Err(e) => {
                warn!("Could not encode subscription: {}", e);
                false
            }
        };
        if !sent {
            return CycleEnd::Lost;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.shared.outgoing.lock().await = Some(out_tx);
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("Connected to {}", self.config.server_url);
        let _ = self.event_tx.send(ClientEvent::Connected { resumed });

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return CycleEnd::Shutdown;
                }
                Some(text) = out_rx.recv() => {
                    if writer.send(Message::Text(text.into())).await.is_err() {
                        return CycleEnd::Lost;
                    }
                }
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match decode::<ServerMessage>(text.as_str()) {
                            Ok(msg) => self.route(msg).await,
                            Err(e) => warn!("Failed to decode server message: {}", e),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if writer.send(Message::Pong(data)).await.is_err() {
                                return CycleEnd::Lost;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return CycleEnd::Lost,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn route(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Change(event) => {
                let _ = self.event_tx.send(ClientEvent::Change(event));
            }
            ServerMessage::Subscribed { project_path } => {
                debug!("Subscribed to {}", project_path);
                *self.shared.project_id.write().await = Some(project_path);
            }
            ServerMessage::Pong => debug!("Pong from {}", self.config.server_url),
            reply => match reply.request_id() {
                Some(id) => match self.shared.pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!("Reply to unknown request {}", id),
                },
                None => warn!("Server error: {:?}", reply),
            },
        }
    }
}
