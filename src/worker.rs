//! The single-consumer loop that drains the task store and drives the uploader.
//!
//! One task at a time, oldest-due first: ask the store, dispatch by
//! action, report success or failure back to the store. This is the only
//! reader of the queue; everything else only ever writes to it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::store::{TaskAction, TaskExtra, TaskStore};
use crate::uploader::Uploader;

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const FAILURE_THROTTLE: Duration = Duration::from_secs(3);

/// HTTP status the uploader reports for an integrity conflict, treated
/// as terminal rather than retried forever (see the design note on 409
/// handling).
const CONFLICT_STATUS: u16 = 409;

/// Progress report cadence: fire at start, completion, and roughly every
/// fifth of the way through, never once per chunk.
fn should_report_progress(done: u64, total: u64) -> bool {
    if total == 0 || done == 0 || done == total {
        return true;
    }
    let step = (total / 5).max(1);
    done % step == 0
}

/// Runs the worker loop until `shutdown` resolves.
#[instrument(skip(store, uploader, shutdown))]
pub async fn run(
    store: TaskStore,
    uploader: Arc<dyn Uploader>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let task = tokio::select! {
            task = store.take_due() => task,
            _ = shutdown.changed() => continue,
        };

        let task = match task {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
            Err(err) => {
                error!(%err, "failed to query task store");
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
        };

        let outcome = process_task(&task, uploader.as_ref()).await;
        match outcome {
            TaskOutcome::Success => {
                if let Err(err) = store.complete(task.id).await {
                    error!(id = task.id, %err, "failed to mark task complete");
                }
                info!(id = task.id, action = %task.action, "✅ task completed");
            }
            TaskOutcome::Terminal => {
                if let Err(err) = store.complete(task.id).await {
                    error!(id = task.id, %err, "failed to drop terminally-failed task");
                }
                error!(id = task.id, action = %task.action, "❌ task permanently failed, dropped");
            }
            TaskOutcome::Retry => {
                if let Err(err) = store.fail(task.id).await {
                    error!(id = task.id, %err, "failed to schedule retry");
                }
                warn!(id = task.id, action = %task.action, "⚠️ task failed, will retry");
                tokio::time::sleep(FAILURE_THROTTLE).await;
            }
        }
    }
}

enum TaskOutcome {
    Success,
    Retry,
    Terminal,
}

#[instrument(skip(uploader, task), fields(id = task.id, action = %task.action))]
async fn process_task(task: &crate::store::TaskRow, uploader: &dyn Uploader) -> TaskOutcome {
    let action = match task.parsed_action() {
        Ok(action) => action,
        Err(err) => {
            error!(id = task.id, error = %err, "task has unrecognized action, dropping");
            return TaskOutcome::Terminal;
        }
    };
    let extra = match task.parsed_extra() {
        Ok(extra) => extra,
        Err(err) => {
            error!(id = task.id, error = %err, "task has unparseable payload, dropping");
            return TaskOutcome::Terminal;
        }
    };

    match action {
        TaskAction::Upload => process_upload(task, &extra, uploader).await,
        TaskAction::Audit => {
            if uploader.send_audit(&extra).await {
                TaskOutcome::Success
            } else {
                TaskOutcome::Retry
            }
        }
        TaskAction::Mkdir | TaskAction::Delete | TaskAction::Rename => {
            if uploader.send_operation(action, &task.rel_path, &extra).await {
                TaskOutcome::Success
            } else {
                TaskOutcome::Retry
            }
        }
    }
}

async fn process_upload(
    task: &crate::store::TaskRow,
    extra: &TaskExtra,
    uploader: &dyn Uploader,
) -> TaskOutcome {
    let TaskExtra::Upload { md5, mtime } = extra else {
        error!(id = task.id, "UPLOAD task carries non-upload payload");
        return TaskOutcome::Terminal;
    };

    let local_path = PathBuf::from(&task.local_path);
    if !local_path.exists() {
        info!(id = task.id, path = %local_path.display(), "file vanished before upload, completing silently");
        return TaskOutcome::Success;
    }

    let id = task.id;
    let rel_path = task.rel_path.clone();
    let progress = move |done: u64, total: u64| {
        if should_report_progress(done, total) {
            info!(id, done, total, "upload progress");
        }
    };

    let result = uploader
        .upload_file_chunked(&local_path, &rel_path, md5, *mtime, &progress)
        .await;

    if result.success {
        TaskOutcome::Success
    } else if result.http_status == CONFLICT_STATUS {
        error!(id = task.id, "integrity conflict reported by server, treating as terminal");
        TaskOutcome::Terminal
    } else {
        TaskOutcome::Retry
    }
}
