//! Structured logging setup: a console layer plus a daily-rotating file
//! layer under the log directory resolved by [`crate::layout::Layout`],
//! both driven by one level filter.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Picks a default level from repeated `-v`/`-q` flags, the same
/// precedence the CLI uses: `RUST_LOG` env var wins outright, then
/// `quiet`, then `verbose` count, then `info`.
#[must_use]
pub fn default_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Initializes the global subscriber with console + rotating-file output.
///
/// Returns a [`WorkerGuard`] that must be kept alive for the lifetime of
/// the process: dropping it flushes and stops the background writer
/// thread that backs the non-blocking file appender.
pub fn init(log_path: &Path, verbose: u8, quiet: bool) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose, quiet)));

    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("client_service.log");
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_precedence() {
        assert_eq!(default_level(0, true), "error");
        assert_eq!(default_level(0, false), "info");
        assert_eq!(default_level(1, false), "debug");
        assert_eq!(default_level(2, false), "trace");
        assert_eq!(default_level(5, false), "trace");
    }
}
