//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

/// Lab-instrument file-sync reliability agent.
///
/// Watches a directory tree for instrument output and reliably
/// propagates changes to a central ingestion server, with no subcommand
/// running as a long-lived background agent.
#[derive(Parser, Debug)]
#[command(name = "labsync-agent")]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Force portable on-disk layout (DB and logs next to the executable)
    /// regardless of the config file's `PORTABLE_MODE` setting.
    #[arg(long, global = true)]
    pub portable: bool,

    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = "config.json")]
    pub config: std::path::PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a one-shot full-tree reconciliation against the server, then exit.
    Rescan,
}
