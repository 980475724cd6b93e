//! Error types for the filesystem watcher.

use thiserror::Error;

/// Errors setting up the OS filesystem notification subscription.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to set up filesystem watch: {0}")]
    Notify(#[from] notify::Error),
}
