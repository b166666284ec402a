//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server over a temporary project and connect
//! real clients, verifying the full read, write, watch and notify pipeline.

use std::path::Path;
use std::sync::Arc;

use specdesk_sync::cache::CacheUpdate;
use specdesk_sync::client::{ClientConfig, ClientEvent, ConnectionState, SyncClient};
use specdesk_sync::files::{Resolution, WriteOutcome};
use specdesk_sync::protocol::{ChangeKind, ErrorKind};
use specdesk_sync::server::{ServerConfig, SyncServer};
use specdesk_sync::session::{EditorSession, SaveOutcome};
use specdesk_sync::SyncError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn project_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("openspec")).unwrap();
    dir
}

fn doc(dir: &tempfile::TempDir, relative: &str) -> std::path::PathBuf {
    dir.path().join("openspec").join(relative)
}

/// Start a server on `bind_addr`, return it with its WebSocket URL.
async fn start_server_on(bind_addr: &str, large_file_threshold: usize) -> (Arc<SyncServer>, String) {
    let mut config = ServerConfig::for_testing();
    config.bind_addr = bind_addr.to_string();
    config.sync = config.sync.with_large_file_threshold(large_file_threshold);

    let server = Arc::new(SyncServer::new(config));
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, url)
}

async fn start_test_server() -> (Arc<SyncServer>, String) {
    start_server_on("127.0.0.1:0", 500 * 1024).await
}

fn client_config(url: &str, root: &Path) -> ClientConfig {
    ClientConfig::new(url, root.to_string_lossy())
        .with_backoff(Duration::from_millis(20), Duration::from_millis(200))
        .with_request_timeout(Duration::from_secs(2))
}

/// Connect a client and wait until it is subscribed.
async fn connected_client(url: &str, root: &Path) -> (SyncClient, UnboundedReceiver<ClientEvent>) {
    let mut client = SyncClient::connect(client_config(url, root));
    let events = client.take_events().unwrap();
    timeout(Duration::from_secs(2), client.wait_for_state(ConnectionState::Connected))
        .await
        .expect("client should connect")
        .unwrap();
    // Requests are answered in order, so after one round trip the
    // subscription is live.
    let _ = client.read("warmup.md").await;
    (client, events)
}

/// Wait for the next change event on `path`.
async fn next_change(events: &mut UnboundedReceiver<ClientEvent>, path: &str) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Change(event)) if event.path == path => {
                    return ClientEvent::Change(event);
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("change event should arrive")
}

#[tokio::test]
async fn test_client_reads_document() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "spec.md"), "# Spec\n").unwrap();
    let (_server, url) = start_test_server().await;

    let (client, _events) = connected_client(&url, dir.path()).await;
    let file = client.read("spec.md").await.unwrap();
    assert_eq!(file.content, "# Spec\n");
    assert_eq!(file.size, 7);
    assert!(!file.is_large);

    let canonical = dir.path().canonicalize().unwrap();
    assert_eq!(
        client.project_id().await,
        Some(canonical.to_string_lossy().into_owned())
    );
}

#[tokio::test]
async fn test_read_errors_over_the_wire() {
    let dir = project_dir();
    let (_server, url) = start_test_server().await;
    let (client, _events) = connected_client(&url, dir.path()).await;

    let err = client.read("specs/missing.md").await.unwrap_err();
    assert!(err.is_not_found());

    for bad in ["../outside.md", "notes.txt"] {
        match client.read(bad).await {
            Err(SyncError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::InvalidRequest),
            other => panic!("expected invalid request for {bad}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_missing_project_is_not_subscribed() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    let (_server, url) = start_test_server().await;
    let (client, _events) = connected_client(&url, &missing).await;

    match client.read("a.md").await {
        Err(SyncError::Remote { kind, .. }) => assert_eq!(kind, ErrorKind::NotSubscribed),
        other => panic!("expected not-subscribed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stale_write_is_rejected_and_resolved() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "a.md"), "base\n").unwrap();
    let (_server, url) = start_test_server().await;
    let (alice, _a) = connected_client(&url, dir.path()).await;
    let (bob, _b) = connected_client(&url, dir.path()).await;

    let base = alice.read("a.md").await.unwrap().etag;
    assert_eq!(bob.read("a.md").await.unwrap().etag, base);

    let outcome = alice.write("a.md", "alice\n".into(), Some(&base)).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Written(_)));

    let WriteOutcome::Conflict(conflict) = bob.write("a.md", "bob\n".into(), Some(&base)).await.unwrap() else {
        panic!("expected conflict");
    };
    assert_eq!(conflict.current, "alice\n");
    assert_eq!(std::fs::read_to_string(doc(&dir, "a.md")).unwrap(), "alice\n");

    let merged = bob
        .resolve("a.md", Resolution::Merge("alice\nbob\n".into()))
        .await
        .unwrap();
    assert_eq!(merged.content, "alice\nbob\n");
    assert_eq!(std::fs::read_to_string(doc(&dir, "a.md")).unwrap(), "alice\nbob\n");
}

#[tokio::test]
async fn test_save_fans_out_to_other_sessions() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "a.md"), "v1\n").unwrap();
    let (_server, url) = start_test_server().await;
    let (alice, mut alice_events) = connected_client(&url, dir.path()).await;
    let (bob, mut bob_events) = connected_client(&url, dir.path()).await;

    let mut alice = EditorSession::from_client(alice);
    let mut bob = EditorSession::from_client(bob);
    alice.open("a.md").await.unwrap();
    bob.open("a.md").await.unwrap();

    let saved = alice.save("a.md", "v2\n".into()).await.unwrap();
    assert!(matches!(saved, SaveOutcome::Saved(_)));

    // The writer sees its own change echoed back and ignores it.
    let echo = next_change(&mut alice_events, "a.md").await;
    assert_eq!(
        alice.handle_client_event(&echo).await.unwrap(),
        Some(CacheUpdate::Unchanged)
    );

    let change = next_change(&mut bob_events, "a.md").await;
    let update = bob.handle_client_event(&change).await.unwrap();
    assert!(matches!(update, Some(CacheUpdate::Replaced | CacheUpdate::Patched)));
    assert_eq!(bob.cache().peek("a.md").unwrap().content, "v2\n");
}

#[tokio::test]
async fn test_external_edit_patches_cache() {
    let dir = project_dir();
    let original: String = (0..20).map(|i| format!("line {i}\n")).collect();
    std::fs::write(doc(&dir, "big.md"), &original).unwrap();
    // Every document counts as large, so events carry only a diff.
    let (_server, url) = start_server_on("127.0.0.1:0", 4).await;
    let (client, mut events) = connected_client(&url, dir.path()).await;

    let mut session = EditorSession::from_client(client);
    assert_eq!(session.cache().capacity(), 50);
    assert!(session.open("big.md").await.unwrap().is_large);

    let edited = original.replace("line 10\n", "line ten\n") + "appended\n";
    std::fs::write(doc(&dir, "big.md"), &edited).unwrap();

    let change = next_change(&mut events, "big.md").await;
    if let ClientEvent::Change(event) = &change {
        assert_eq!(event.event, ChangeKind::Modified);
        assert!(event.content.is_none());
        assert!(event.diff.as_deref().is_some_and(|d| d.contains("+line ten")));
    }
    assert_eq!(
        session.handle_client_event(&change).await.unwrap(),
        Some(CacheUpdate::Patched)
    );

    let patched = session.cache().peek("big.md").unwrap().clone();
    let fresh = session.api().read("big.md").await.unwrap();
    assert_eq!(patched.content, fresh.content);
    assert_eq!(patched.etag, fresh.etag);
}

#[tokio::test]
async fn test_removal_is_announced() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "gone.md"), "bye\n").unwrap();
    let (_server, url) = start_test_server().await;
    let (client, mut events) = connected_client(&url, dir.path()).await;
    client.read("gone.md").await.unwrap();

    std::fs::remove_file(doc(&dir, "gone.md")).unwrap();
    let ClientEvent::Change(event) = next_change(&mut events, "gone.md").await else {
        unreachable!();
    };
    assert_eq!(event.event, ChangeKind::Removed);
    assert!(event.etag.is_none());
}

#[tokio::test]
async fn test_client_reconnects_to_late_server() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "a.md"), "hello\n").unwrap();
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = SyncClient::connect(client_config(&url, dir.path()));
    let mut events = client.take_events().unwrap();

    let first = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert!(matches!(first, Some(ClientEvent::ReconnectScheduled { attempt: 1, .. })));

    let (_server, _) = start_server_on(&format!("127.0.0.1:{port}"), 500 * 1024).await;
    timeout(Duration::from_secs(3), client.wait_for_state(ConnectionState::Connected))
        .await
        .expect("client should reconnect")
        .unwrap();

    assert_eq!(client.read("a.md").await.unwrap().content, "hello\n");
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let dir = project_dir();
    let (server, url) = start_test_server().await;
    let (client, _events) = connected_client(&url, dir.path()).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_projects, 1);

    client.disconnect().await;
    timeout(Duration::from_secs(2), async {
        while server.stats().await.active_connections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server should notice the disconnect");
}

/// Wait for a connection event matching `wanted`.
async fn next_connection_event(events: &mut UnboundedReceiver<ClientEvent>, wanted: fn(&ClientEvent) -> bool) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("connection event should arrive")
}

#[tokio::test]
async fn test_session_catches_up_after_server_restart() {
    let dir = project_dir();
    std::fs::write(doc(&dir, "a.md"), "before\n").unwrap();
    let port = free_port().await;
    let addr = format!("127.0.0.1:{port}");
    let (first, url) = start_server_on(&addr, 500 * 1024).await;
    let (client, mut events) = connected_client(&url, dir.path()).await;
    let project_id = client.project_id().await;

    let mut session = EditorSession::from_client(client);
    session.open("a.md").await.unwrap();
    let old_etag = session.base_etag("a.md").cloned().unwrap();

    first.shutdown();
    next_connection_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    drop(first);
    timeout(Duration::from_secs(2), async {
        while tokio::net::TcpStream::connect(&addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old listener should be closed");

    // Edited while nobody was listening, so no event will ever say so.
    std::fs::write(doc(&dir, "a.md"), "after the outage\n").unwrap();
    let (second, _) = start_server_on(&addr, 500 * 1024).await;

    let resumed = next_connection_event(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(resumed, ClientEvent::Connected { resumed: true });
    assert_eq!(session.handle_client_event(&resumed).await.unwrap(), None);

    let cached = session.cache().peek("a.md").unwrap().clone();
    assert_eq!(cached.content, "after the outage\n");
    assert!(cached.etag.matches("after the outage\n"));
    assert_ne!(cached.etag, old_etag);
    assert_eq!(session.api().project_id().await, project_id);

    // The resubscription is live: later edits arrive as events.
    std::fs::write(doc(&dir, "a.md"), "after the outage\nand more\n").unwrap();
    let change = next_change(&mut events, "a.md").await;
    session.handle_client_event(&change).await.unwrap();
    assert_eq!(session.cache().peek("a.md").unwrap().content, "after the outage\nand more\n");
    assert_eq!(second.stats().await.active_connections, 1);
}
