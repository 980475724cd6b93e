//! Resolves where durable state (task database, logs) lives on disk.
//!
//! Non-portable installs use the platform's conventional per-user data
//! directory; portable installs keep everything next to the executable,
//! for USB-stick-style deployment.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

const QUALIFIER: &str = "";
const ORGANIZATION: &str = "";
const APPLICATION: &str = "LabSyncClient";

/// Resolved locations for the agent's durable state.
#[derive(Debug, Clone)]
pub struct Layout {
    pub db_path: PathBuf,
    pub log_path: PathBuf,
}

impl Layout {
    /// Resolves the layout for a given `portable_mode` flag and the
    /// directory containing the running executable.
    #[must_use]
    pub fn resolve(portable_mode: bool, exe_dir: &Path) -> Self {
        let base = if portable_mode {
            exe_dir.to_path_buf()
        } else {
            ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| exe_dir.to_path_buf())
        };

        Self {
            db_path: base.join("client_tasks.db"),
            log_path: base.join("logs").join("client_service.log"),
        }
    }
}
