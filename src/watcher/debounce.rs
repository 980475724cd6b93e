//! Coalesces bursty filesystem writes into a single "file is stable" event.
//!
//! Lab instruments write output files in bursts (header, body, trailer)
//! over the span of a second or more. Uploading on the first write event
//! would ship a truncated file. Instead every touch resets a per-path
//! clock; a scanner task wakes once per [`Debouncer::scan_interval`] and
//! promotes any path that has gone [`Debouncer::stability_wait`] without a
//! further touch to "stable", handing it off on a channel rather than
//! calling back into the watcher directly (see the design note on
//! decoupling debouncer from handler).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// In-memory `path -> last touch time` map and the clock that drains it.
#[derive(Debug, Clone)]
pub struct Debouncer {
    pending: Arc<Mutex<HashMap<PathBuf, Instant>>>,
    stability_wait: Duration,
    scan_interval: Duration,
    stable_tx: mpsc::Sender<PathBuf>,
}

impl Debouncer {
    /// Creates a debouncer that sends stabilized paths to `stable_tx`.
    #[must_use]
    pub fn new(
        stability_wait: Duration,
        scan_interval: Duration,
        stable_tx: mpsc::Sender<PathBuf>,
    ) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            stability_wait,
            scan_interval,
            stable_tx,
        }
    }

    /// Records (or refreshes) a touch on `path`, resetting its stability clock.
    pub fn touch(&self, path: PathBuf) {
        self.pending.lock().insert(path, Instant::now());
    }

    /// Removes `path` from the pending map without emitting a stable event,
    /// e.g. when the watcher learns the path was deleted or renamed away
    /// before it ever stabilized.
    pub fn forget(&self, path: &std::path::Path) {
        self.pending.lock().remove(path);
    }

    /// Runs the scan loop until the channel receiver is dropped. Intended
    /// to be spawned as its own Tokio task.
    #[instrument(skip(self))]
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            ticker.tick().await;
            let stable: Vec<PathBuf> = {
                let mut pending = self.pending.lock();
                let now = Instant::now();
                let stable_paths: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, touched)| now.duration_since(**touched) >= self.stability_wait)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in &stable_paths {
                    pending.remove(path);
                }
                stable_paths
            };

            for path in stable {
                debug!(path = %path.display(), "file considered stable");
                if self.stable_tx.send(path).await.is_err() {
                    return;
                }
            }
        }
    }
}
