//! Configuration loading.
//!
//! The on-disk format is a single JSON document. It is loaded once at
//! startup into an immutable [`Config`] value and threaded through every
//! component's constructor; there is no hidden global configuration state.
//! A missing or malformed file is not fatal: defaults take over and the
//! condition is logged once.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const DEFAULT_SERVER_IP: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_AUTH_TOKEN: &str = "lab-secret-key-universal-2025";
const DEFAULT_STABILITY_WAIT_SECS: f64 = 3.0;
const DEFAULT_SCAN_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_BACKOFF_SECS: i64 = 3600;
const DEFAULT_CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Raw, partially-specified configuration as read from the JSON file.
/// Every field is optional; absent fields fall back to defaults in
/// [`Config::resolve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct FileConfig {
    pub portable_mode: Option<bool>,
    pub watch_dir: Option<PathBuf>,
    pub server_ip: Option<String>,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    pub instrument_alias: Option<String>,
    pub stability_wait_secs: Option<f64>,
    pub scan_interval_secs: Option<f64>,
    pub max_retries: Option<u32>,
    pub max_backoff_secs: Option<i64>,
    pub chunk_size_bytes: Option<u64>,
}

/// Errors encountered while loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fully resolved, immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub portable_mode: bool,
    pub watch_dir: PathBuf,
    pub server_ip: String,
    pub port: u16,
    pub auth_token: String,
    pub instrument_alias: String,
    pub stability_wait: std::time::Duration,
    pub scan_interval: std::time::Duration,
    pub max_retries: u32,
    pub max_backoff_secs: i64,
    pub chunk_size_bytes: u64,
}

impl Config {
    /// Base URL for the ingestion server's API, e.g. `http://127.0.0.1:5000/api`.
    #[must_use]
    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}/api", self.server_ip, self.port)
    }

    /// Loads configuration from `path`, falling back to defaults entirely
    /// when the file is absent, and logging (not failing) on a malformed
    /// file.
    pub fn load(path: &Path, exe_dir: &Path) -> Self {
        let file_config = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<FileConfig>(&contents) {
                Ok(parsed) => parsed,
                Err(source) => {
                    warn!(
                        path = %path.display(),
                        error = %source,
                        "config file is malformed, falling back to defaults"
                    );
                    FileConfig::default()
                }
            },
            Err(_) => FileConfig::default(),
        };

        Self::resolve(file_config, exe_dir)
    }

    /// Fills in defaults for every field left unspecified in `file_config`.
    #[must_use]
    pub fn resolve(file_config: FileConfig, exe_dir: &Path) -> Self {
        let watch_dir = file_config
            .watch_dir
            .unwrap_or_else(|| exe_dir.join("data"));

        let instrument_alias = file_config.instrument_alias.unwrap_or_else(default_alias);

        Self {
            portable_mode: file_config.portable_mode.unwrap_or(false),
            watch_dir,
            server_ip: file_config
                .server_ip
                .unwrap_or_else(|| DEFAULT_SERVER_IP.to_string()),
            port: file_config.port.unwrap_or(DEFAULT_PORT),
            auth_token: file_config
                .auth_token
                .unwrap_or_else(|| DEFAULT_AUTH_TOKEN.to_string()),
            instrument_alias,
            stability_wait: std::time::Duration::from_secs_f64(
                file_config
                    .stability_wait_secs
                    .filter(|v| *v > 0.0)
                    .unwrap_or(DEFAULT_STABILITY_WAIT_SECS),
            ),
            scan_interval: std::time::Duration::from_secs_f64(
                file_config
                    .scan_interval_secs
                    .filter(|v| *v > 0.0)
                    .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
            ),
            max_retries: file_config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            max_backoff_secs: file_config
                .max_backoff_secs
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
            chunk_size_bytes: file_config
                .chunk_size_bytes
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE_BYTES),
        }
    }
}

fn default_alias() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
