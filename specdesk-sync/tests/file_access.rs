//! Etag-checked file access through the project registry.

use specdesk_sync::config::SyncConfig;
use specdesk_sync::etag::ETag;
use specdesk_sync::files::{Resolution, WriteOutcome};
use specdesk_sync::project::ProjectManager;

fn project_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("openspec")).unwrap();
    dir
}

fn manager() -> ProjectManager {
    ProjectManager::new(SyncConfig::for_testing())
}

#[tokio::test]
async fn test_read_on_empty_project_is_not_found() {
    let dir = project_dir();
    let err = manager().read_file(dir.path(), "specs/a.md").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_write_then_read_returns_identical_payload() {
    let dir = project_dir();
    let manager = manager();

    let WriteOutcome::Written(written) = manager
        .write_file(dir.path(), "specs/a.md", "# A".into(), None)
        .await
        .unwrap()
    else {
        panic!("expected write to succeed");
    };
    assert_eq!(written.content, "# A");
    assert_eq!(written.etag, ETag::compute("# A"));

    let read = manager.read_file(dir.path(), "specs/a.md").await.unwrap();
    assert_eq!(read, written);
}

#[tokio::test]
async fn test_second_writer_with_stale_etag_conflicts() {
    let dir = project_dir();
    let manager = manager();
    manager
        .write_file(dir.path(), "specs/a.md", "# A".into(), None)
        .await
        .unwrap();

    // A and B both hold E1.
    let e1 = manager.read_file(dir.path(), "specs/a.md").await.unwrap().etag;

    let WriteOutcome::Written(a) = manager
        .write_file(dir.path(), "specs/a.md", "# A v2".into(), Some(&e1))
        .await
        .unwrap()
    else {
        panic!("first writer should succeed");
    };
    let e2 = a.etag;
    assert_ne!(e1, e2);

    match manager
        .write_file(dir.path(), "specs/a.md", "# A v3".into(), Some(&e1))
        .await
        .unwrap()
    {
        WriteOutcome::Conflict(conflict) => {
            assert_eq!(conflict.current, "# A v2");
            assert_eq!(conflict.etag, e2);
        }
        WriteOutcome::Written(_) => panic!("stale write must be rejected"),
    }
    let on_disk = std::fs::read_to_string(dir.path().join("openspec/specs/a.md")).unwrap();
    assert_eq!(on_disk, "# A v2");
}

#[tokio::test]
async fn test_remote_resolution_equals_fresh_read() {
    let dir = project_dir();
    let manager = manager();
    manager
        .write_file(dir.path(), "a.md", "current".into(), None)
        .await
        .unwrap();

    let resolved = manager
        .resolve_conflict(dir.path(), "a.md", Resolution::Remote)
        .await
        .unwrap();
    let fresh = manager.read_file(dir.path(), "a.md").await.unwrap();
    assert_eq!(resolved, fresh);
}

#[tokio::test]
async fn test_diff_since_snapshot_tracks_external_edits() {
    let dir = project_dir();
    let manager = manager();
    manager
        .write_file(dir.path(), "a.md", "one\n".into(), None)
        .await
        .unwrap();
    std::fs::write(dir.path().join("openspec/a.md"), "one\ntwo\n").unwrap();

    let diff = manager
        .diff_since_snapshot(dir.path(), "a.md")
        .await
        .unwrap()
        .unwrap();
    assert!(diff.contains("+two"));

    // The disk is the new baseline.
    let again = manager
        .diff_since_snapshot(dir.path(), "a.md")
        .await
        .unwrap()
        .unwrap();
    assert!(!again.contains("+two"));
    assert_eq!(manager.diff_since_snapshot(dir.path(), "b.md").await.unwrap(), None);
}

#[tokio::test]
async fn test_etag_is_deterministic_and_content_sensitive() {
    assert_eq!(ETag::compute("# A"), ETag::compute("# A"));
    assert_ne!(ETag::compute("# A"), ETag::compute("# A "));
}
