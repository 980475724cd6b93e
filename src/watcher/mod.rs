//! Subscribes to OS filesystem events under the watch root and turns them
//! into task-store writes: directory creation, the debouncer's file
//! touches, renames, and deletions, each paired with an `AUDIT` record
//! where the design calls for one.
//!
//! `notify`'s callback fires on its own OS-driven thread, synchronously;
//! running classification or a blocking store write there would stall
//! whatever `notify` uses internally. So the callback thread does nothing
//! but forward raw events over a channel into the async world, where this
//! module's `run` loop does the actual classification and enqueueing.

pub mod debounce;
mod error;

pub use error::WatcherError;

use std::path::{Path, PathBuf};

use chrono::Local;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::paths;
use crate::store::{TaskExtra, TaskStore};
use debounce::Debouncer;

/// Bridges `notify`'s synchronous callback thread into an async channel.
/// The returned [`RecommendedWatcher`] must be kept alive for as long as
/// events should keep flowing; dropping it tears down the OS subscription.
pub fn spawn_bridge(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<notify::Event>), WatcherError> {
    let (raw_tx, mut raw_rx) = std::sync::mpsc::channel::<notify::Event>();
    let (tokio_tx, tokio_rx) = mpsc::channel(256);

    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(err) => warn!(error = %err, "filesystem watch error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    std::thread::spawn(move || {
        while let Ok(event) = raw_rx.recv() {
            if tokio_tx.blocking_send(event).is_err() {
                break;
            }
        }
    });

    Ok((watcher, tokio_rx))
}

/// Drains classified filesystem events from `events`, writing tasks to
/// `store` and touching `debouncer` for plain file writes, until the
/// channel closes.
#[instrument(skip(events, store, debouncer), fields(root = %root.display()))]
pub async fn run(
    root: PathBuf,
    machine_id: String,
    mut events: mpsc::Receiver<notify::Event>,
    store: TaskStore,
    debouncer: Debouncer,
) {
    while let Some(event) = events.recv().await {
        handle_event(&root, &machine_id, event, &store, &debouncer).await;
    }
}

async fn handle_event(
    root: &Path,
    machine_id: &str,
    event: notify::Event,
    store: &TaskStore,
    debouncer: &Debouncer,
) {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => {
            if let Some(path) = event.paths.first() {
                handle_directory_created(root, path, store).await;
            }
        }
        EventKind::Create(_) => {
            for path in &event.paths {
                handle_file_created(root, machine_id, path, store, debouncer).await;
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                handle_rename(root, machine_id, from, to, store, debouncer).await;
            }
        }
        EventKind::Modify(ModifyKind::Data(_)) => {
            for path in &event.paths {
                if path.is_dir() || paths::should_ignore(path) {
                    continue;
                }
                debouncer.touch(path.clone());
            }
        }
        EventKind::Modify(_) => {}
        EventKind::Remove(kind) => {
            for path in &event.paths {
                handle_removed(root, machine_id, path, kind, store, debouncer).await;
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
}

async fn handle_directory_created(root: &Path, path: &Path, store: &TaskStore) {
    if paths::should_ignore(path) {
        return;
    }
    let Some(rel_path) = paths::relative_path(path, root) else {
        return;
    };
    let _ = store.add("", &rel_path, TaskExtra::Mkdir {}).await;
}

async fn handle_file_created(
    root: &Path,
    machine_id: &str,
    path: &Path,
    store: &TaskStore,
    debouncer: &Debouncer,
) {
    if paths::should_ignore(path) {
        return;
    }
    if paths::is_placeholder(path) && std::fs::metadata(path).map(|m| m.len()).unwrap_or(0) == 0 {
        return;
    }
    let Some(rel_path) = paths::relative_path(path, root) else {
        return;
    };

    debouncer.touch(path.to_path_buf());
    enqueue_audit(store, machine_id, "CREATED", &rel_path, None).await;
}

async fn handle_rename(
    root: &Path,
    machine_id: &str,
    from: &Path,
    to: &Path,
    store: &TaskStore,
    debouncer: &Debouncer,
) {
    let src_ignored = paths::should_ignore(from);
    let dst_ignored = paths::should_ignore(to);

    debouncer.forget(from);

    if src_ignored && dst_ignored {
        return;
    }

    if src_ignored {
        if to.is_dir() {
            handle_directory_created(root, to, store).await;
        } else {
            handle_file_created(root, machine_id, to, store, debouncer).await;
        }
        return;
    }

    let (Some(old_rel), Some(new_rel)) = (
        paths::relative_path(from, root),
        paths::relative_path(to, root),
    ) else {
        return;
    };

    let _ = store
        .add("", &old_rel, TaskExtra::Rename { new_path: new_rel.clone() })
        .await;
    enqueue_audit(store, machine_id, "MOVED", &old_rel, Some(new_rel)).await;
}

async fn handle_removed(
    root: &Path,
    machine_id: &str,
    path: &Path,
    kind: RemoveKind,
    store: &TaskStore,
    debouncer: &Debouncer,
) {
    if paths::should_ignore(path) {
        return;
    }
    let Some(rel_path) = paths::relative_path(path, root) else {
        return;
    };

    debouncer.forget(path);
    let is_dir = matches!(kind, RemoveKind::Folder);
    let _ = store
        .add("", &rel_path, TaskExtra::Delete { is_dir })
        .await;
    enqueue_audit(store, machine_id, "DELETED", &rel_path, None).await;
}

async fn enqueue_audit(
    store: &TaskStore,
    machine_id: &str,
    event: &str,
    path: &str,
    old_path: Option<String>,
) {
    let audit = TaskExtra::Audit {
        id: Uuid::new_v4().to_string(),
        timestamp: Local::now().to_rfc3339(),
        machine_id: machine_id.to_string(),
        event: event.to_string(),
        path: path.to_string(),
        old_path,
    };
    if let Err(err) = store.add("", "", audit).await {
        debug!(%err, "failed to enqueue audit record");
    }
}

/// Implements the debouncer's stable-handler policy (§4.3): re-check the
/// path still exists and is not a directory, probe for an exclusive
/// writer, fingerprint, and enqueue an `UPLOAD` task.
#[instrument(skip(store, debouncer), fields(path = %path.display()))]
pub async fn handle_stable_path(root: &Path, path: &Path, store: &TaskStore, debouncer: &Debouncer) {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => return,
    };

    // A file still being written by another process typically cannot be
    // opened for append without error on Windows; on Unix this is a
    // heuristic rather than a guarantee. Re-arming the debouncer on
    // failure is what actually buys safety margin: the path gets a fresh
    // touch and the stability wait restarts instead of the file being
    // dropped silently.
    if std::fs::OpenOptions::new().append(true).open(path).is_err() {
        debouncer.touch(path.to_path_buf());
        return;
    }

    let Some(fingerprint) = paths::fingerprint(path) else {
        return;
    };
    let Some(rel_path) = paths::relative_path(path, root) else {
        return;
    };
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64());

    let local_path = path.to_string_lossy().to_string();
    let extra = TaskExtra::Upload {
        md5: fingerprint,
        mtime,
    };
    if let Err(err) = store.add(&local_path, &rel_path, extra).await {
        debug!(%err, "failed to enqueue upload task");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::TaskAction;
    use std::time::Duration;

    async fn store() -> TaskStore {
        TaskStore::new(Database::new_in_memory().await.unwrap())
    }

    fn test_debouncer() -> (Debouncer, mpsc::Receiver<PathBuf>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Debouncer::new(Duration::from_secs(3), Duration::from_secs(1), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn handle_stable_path_enqueues_upload_for_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let store = store().await;
        let (debouncer, _rx) = test_debouncer();
        handle_stable_path(dir.path(), &file_path, &store, &debouncer).await;

        let task = store.take_due().await.unwrap().expect("upload enqueued");
        assert_eq!(task.parsed_action().unwrap(), TaskAction::Upload);
        assert_eq!(task.rel_path, "a.txt");
    }

    #[tokio::test]
    async fn handle_stable_path_on_vanished_file_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.txt");

        let store = store().await;
        let (debouncer, _rx) = test_debouncer();
        handle_stable_path(dir.path(), &missing, &store, &debouncer).await;

        assert!(store.take_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_created_event_enqueues_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("newdir");
        std::fs::create_dir(&sub).unwrap();

        let store = store().await;
        handle_directory_created(dir.path(), &sub, &store).await;

        let task = store.take_due().await.unwrap().expect("mkdir enqueued");
        assert_eq!(task.parsed_action().unwrap(), TaskAction::Mkdir);
        assert_eq!(task.rel_path, "newdir");
    }

    #[tokio::test]
    async fn ignored_directory_is_not_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join(".hidden");
        std::fs::create_dir(&sub).unwrap();

        let store = store().await;
        handle_directory_created(dir.path(), &sub, &store).await;

        assert!(store.take_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rename_enqueues_rename_and_audit_tasks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("b.txt");
        std::fs::write(&to, b"data").unwrap();

        let store = store().await;
        let (debounce_tx, _debounce_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(
            Duration::from_secs(3),
            Duration::from_secs(1),
            debounce_tx,
        );

        handle_rename(dir.path(), "machine-1", &from, &to, &store, &debouncer).await;

        let first = store.take_due().await.unwrap().expect("rename task");
        assert_eq!(first.parsed_action().unwrap(), TaskAction::Rename);
        store.complete(first.id).await.unwrap();

        let second = store.take_due().await.unwrap().expect("audit task");
        assert_eq!(second.parsed_action().unwrap(), TaskAction::Audit);
        assert_eq!(second.rel_path, "", "AUDIT rows carry no rel_path; the path lives in extra");
    }

    #[tokio::test]
    async fn rename_of_unignored_file_does_not_touch_the_debouncer() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("b.txt");
        std::fs::write(&to, b"data").unwrap();

        let store = store().await;
        let (debounce_tx, mut debounce_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(
            Duration::from_secs(3),
            Duration::from_secs(1),
            debounce_tx,
        );

        handle_rename(dir.path(), "machine-1", &from, &to, &store, &debouncer).await;

        // The cheap server-side RENAME already covers this; touching the
        // debouncer here would force a spurious re-fingerprint and re-upload.
        assert!(debounce_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn directory_renamed_out_of_an_ignored_source_enqueues_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join(".hidden_dir");
        let to = dir.path().join("visible_dir");
        std::fs::create_dir(&to).unwrap();

        let store = store().await;
        let (debounce_tx, _debounce_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(
            Duration::from_secs(3),
            Duration::from_secs(1),
            debounce_tx,
        );

        handle_rename(dir.path(), "machine-1", &from, &to, &store, &debouncer).await;

        let task = store.take_due().await.unwrap().expect("mkdir enqueued");
        assert_eq!(task.parsed_action().unwrap(), TaskAction::Mkdir);
        assert_eq!(task.rel_path, "visible_dir");
    }

    #[tokio::test]
    async fn removed_file_enqueues_delete_and_audit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");

        let store = store().await;
        let (debounce_tx, _debounce_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(
            Duration::from_secs(3),
            Duration::from_secs(1),
            debounce_tx,
        );

        handle_removed(dir.path(), "machine-1", &path, RemoveKind::File, &store, &debouncer).await;

        let first = store.take_due().await.unwrap().expect("delete task");
        assert_eq!(first.parsed_action().unwrap(), TaskAction::Delete);
        store.complete(first.id).await.unwrap();

        let second = store.take_due().await.unwrap().expect("audit task");
        assert_eq!(second.parsed_action().unwrap(), TaskAction::Audit);
    }
}
