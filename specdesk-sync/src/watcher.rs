//! Per-project filesystem observer.
//!
//! `notify` delivers raw events on its own thread; they are bridged into a
//! tokio task through an unbounded channel. The task keeps one pending
//! entry per path whose deadline moves forward on every new raw event, so
//! a burst of writes to one file settles once, a debounce window after the
//! last of them. Settling happens under the project lock: read the file,
//! diff it against the snapshot, replace the snapshot and broadcast.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::SyncResult;
use crate::files::FilePayload;
use crate::patch::unified_diff;
use crate::project::ProjectCore;
use crate::protocol::{ChangeEvent, ChangeKind};

/// Running watcher for one project. Dropping it stops observation.
pub(crate) struct ProjectWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ProjectWatcher {
    pub(crate) fn start(core: Arc<ProjectCore>) -> SyncResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                // Only fails once the event loop is gone.
                let _ = tx.send(event);
            }
            Err(e) => warn!("Filesystem watcher error: {}", e),
        })?;
        watcher.watch(&core.base_dir, RecursiveMode::Recursive)?;
        info!("Watching {} for project {}", core.base_dir.display(), core.id);

        let task = tokio::spawn(run_event_loop(rx, core));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What raw events said about a path since it last settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingChange {
    created: bool,
    removed: bool,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawChange {
    Created,
    Modified,
    Removed,
}

fn classify(kind: &EventKind) -> Option<RawChange> {
    match kind {
        EventKind::Create(CreateKind::Folder) => None,
        EventKind::Create(_) => Some(RawChange::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawChange::Created),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(RawChange::Modified),
        EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Remove(_) => Some(RawChange::Removed),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(RawChange::Modified),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(RawChange::Modified),
    }
}

fn accumulate(pending: &mut HashMap<PathBuf, PendingChange>, event: notify::Event, debounce: Duration) {
    let deadline = Instant::now() + debounce;

    // A rename reported as one event lists the old path, then the new one.
    let changes: Vec<(PathBuf, RawChange)> = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            paths
                .next()
                .map(|from| (from, RawChange::Removed))
                .into_iter()
                .chain(paths.map(|to| (to, RawChange::Created)))
                .collect()
        }
        kind => match classify(&kind) {
            Some(change) => event.paths.into_iter().map(|p| (p, change)).collect(),
            None => return,
        },
    };

    for (path, change) in changes {
        let entry = pending.entry(path).or_insert(PendingChange {
            created: false,
            removed: false,
            deadline,
        });
        match change {
            RawChange::Created => entry.created = true,
            RawChange::Removed => entry.removed = true,
            RawChange::Modified => {}
        }
        entry.deadline = deadline;
    }
}

/// Remove and return every entry whose quiet period is over.
fn take_ready(pending: &mut HashMap<PathBuf, PendingChange>, now: Instant) -> Vec<(PathBuf, PendingChange)> {
    let mut ready: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, change)| change.deadline <= now)
        .map(|(path, _)| path.clone())
        .collect();
    ready.sort();
    ready
        .into_iter()
        .filter_map(|path| pending.remove_entry(&path))
        .collect()
}

async fn run_event_loop(mut rx: mpsc::UnboundedReceiver<notify::Event>, core: Arc<ProjectCore>) {
    let debounce = core.config.debounce;
    let mut pending: HashMap<PathBuf, PendingChange> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|change| change.deadline).min();
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => accumulate(&mut pending, event, debounce),
                None => break,
            },
            _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                for (path, change) in take_ready(&mut pending, Instant::now()) {
                    settle(&core, &path, change).await;
                }
            }
        }
    }
    debug!("Watcher event loop for {} stopped", core.id);
}

/// `/`-separated path of `path` below `base`.
fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

async fn settle(core: &ProjectCore, path: &Path, change: PendingChange) {
    let Some(relative) = relative_path(&core.base_dir, path) else {
        return;
    };
    let mut snapshots = core.snapshots.lock().await;

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let known = snapshots.delete(&relative).is_some();
            if known || change.removed {
                debug!("{}: {} removed", core.id, relative);
                core.broadcast.broadcast(ChangeEvent::removed(core.id.as_str(), relative));
            }
            return;
        }
        Err(e) => {
            warn!("Could not stat {}: {}", path.display(), e);
            return;
        }
    };
    if !metadata.is_file() {
        return;
    }

    let content = match tokio::fs::read(path).await.map(String::from_utf8) {
        Ok(Ok(content)) => content,
        Ok(Err(_)) => {
            debug!("Skipping non-UTF-8 file {}", path.display());
            return;
        }
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return;
        }
    };

    let kind = if change.created {
        ChangeKind::Added
    } else {
        ChangeKind::Modified
    };
    // After an API write this is the content the write replaced, so the
    // echo still carries a diff other subscribers can apply.
    let diff = unified_diff(&relative, snapshots.baseline(&relative).unwrap_or(""), &content);

    let payload = FilePayload::new(content, core.config.large_file_threshold);
    snapshots.set(&relative, payload.content.clone(), payload.etag.clone());
    debug!(
        "{}: {} settled ({:?}, {} bytes, large: {})",
        core.id, relative, kind, payload.size, payload.is_large
    );
    core.broadcast
        .broadcast(ChangeEvent::updated(core.id.as_str(), relative, kind, diff, payload));
}
