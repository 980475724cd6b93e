//! Error types for the uploader.

use thiserror::Error;

/// Errors building the underlying HTTP client. Per-request failures are
/// not represented here; they are caught and surfaced as an
/// [`super::ApiOutcome`] instead, never propagated as an error, per the
/// "the uploader never raises to the worker" contract.
#[derive(Debug, Error)]
pub enum UploaderError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}
