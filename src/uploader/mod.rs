//! Chunked, resumable HTTP uploader: the heart of the reliability engine.
//!
//! A pooled [`reqwest::Client`] that attaches the bearer token to every
//! request, transparently retries transient (5xx) failures with
//! exponential backoff, and exposes the handful of operations the worker
//! needs: audit logging, simple operation notification, integrity
//! checking, and the chunked upload protocol itself.
//!
//! Every endpoint here is content-addressed and therefore idempotent, so
//! automatic retry-on-5xx is safe: replaying `/upload/chunk` for a chunk
//! the server already has, or `/upload/merge` for a file it has already
//! merged, is a no-op by construction (a constraint this client leans on
//! but does not itself enforce; that lives on the server).

mod error;

pub use error::UploaderError;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

use crate::store::{TaskAction, TaskExtra};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const CHUNK_TIMEOUT_SECS: u64 = 60;
const MERGE_TIMEOUT_SECS: u64 = 30;
const RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Callback invoked with `(chunks_done, total_chunks)` as an upload
/// progresses. Per the progress policy, callers should only fire this at
/// task start, completion, or roughly every 20% of `total_chunks`, never
/// once per chunk on a large file.
pub type ProgressCallback<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// The outcome of a single API call, distinguishing a network/transport
/// failure from a server-reported non-2xx status. The original tool
/// collapsed both into `(false, None)`, losing exactly the distinction the
/// worker needs to special-case a 409 integrity conflict.
#[derive(Debug, Clone)]
pub struct ApiOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub transport_error: Option<String>,
}

impl ApiOutcome {
    fn transport_failure(message: String) -> Self {
        Self {
            ok: false,
            status: None,
            body: None,
            transport_error: Some(message),
        }
    }

    /// True when the server answered with a specific status code, as
    /// opposed to the request never reaching it at all.
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        self.transport_error.is_some()
    }
}

/// Result of the chunked upload protocol: success flag and the HTTP
/// status that best explains the outcome (synthetic statuses 400/500 are
/// used for client-side abort conditions, matching the original tool's
/// sentinel values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResult {
    pub success: bool,
    pub http_status: u16,
}

/// Operations the worker needs from the uploader. Extracted as a trait so
/// tests can substitute a fake without standing up a real HTTP server.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn send_audit(&self, audit: &TaskExtra) -> bool;
    async fn send_operation(&self, action: TaskAction, rel_path: &str, extra: &TaskExtra) -> bool;
    async fn check_integrity(&self, rel_path: &str, md5: &str) -> Option<Value>;
    async fn upload_file_chunked(
        &self,
        local_path: &Path,
        rel_path: &str,
        md5: &str,
        mtime: f64,
        progress: ProgressCallback<'_>,
    ) -> UploadResult;
}

/// The real, `reqwest`-backed uploader.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    base_url: String,
    auth_token: String,
    machine_id: String,
    max_retries: u32,
    chunk_size: u64,
}

impl HttpUploader {
    /// Builds an uploader with a pooled client and the given retry/auth
    /// configuration.
    ///
    /// # Errors
    /// Returns [`UploaderError::ClientBuild`] if the underlying client
    /// cannot be constructed.
    pub fn new(
        base_url: String,
        auth_token: String,
        machine_id: String,
        max_retries: u32,
        chunk_size: u64,
    ) -> Result<Self, UploaderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url,
            auth_token,
            machine_id,
            max_retries,
            chunk_size,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    /// Sends a JSON POST, retrying on {500,502,503,504} with exponential
    /// backoff (factor 1: 1s, 2s, 4s, ...) up to `max_retries` times.
    /// Every other failure mode (timeout, DNS, connection refused, a non-
    /// retryable non-2xx) is surfaced immediately as a transport/status
    /// outcome rather than retried.
    #[instrument(skip(self, body), fields(endpoint = %endpoint))]
    async fn post_json_with_retry(
        &self,
        endpoint: &str,
        body: &impl Serialize,
        timeout: Duration,
    ) -> ApiOutcome {
        let url = self.url(endpoint);
        let mut attempt = 0u32;

        loop {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.auth_token)
                .timeout(timeout)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response.json::<Value>().await.ok();
                        return ApiOutcome {
                            ok: true,
                            status: Some(status.as_u16()),
                            body: parsed,
                            transport_error: None,
                        };
                    }

                    if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < self.max_retries
                    {
                        attempt += 1;
                        let delay = backoff_delay(attempt);
                        warn!(%endpoint, status = status.as_u16(), attempt, ?delay, "retrying after server error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!(%endpoint, status = status.as_u16(), "request failed");
                    return ApiOutcome {
                        ok: false,
                        status: Some(status.as_u16()),
                        body: None,
                        transport_error: None,
                    };
                }
                Err(err) => {
                    warn!(%endpoint, error = %err, "request failed");
                    return ApiOutcome::transport_failure(err.to_string());
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(10))
}

/// Serializes a [`TaskExtra`] and strips its `kind` tag, leaving only the
/// fields the wire protocol actually documents.
fn tagged_fields(extra: &TaskExtra) -> Value {
    let mut value = serde_json::to_value(extra).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("kind");
    }
    value
}

#[async_trait]
impl Uploader for HttpUploader {
    #[instrument(skip(self, audit))]
    async fn send_audit(&self, audit: &TaskExtra) -> bool {
        let payload = tagged_fields(audit);
        let outcome = self
            .post_json_with_retry("/audit", &payload, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .await;
        outcome.ok
    }

    #[instrument(skip(self, extra))]
    async fn send_operation(&self, action: TaskAction, rel_path: &str, extra: &TaskExtra) -> bool {
        let mut payload = serde_json::json!({
            "action": action.as_str(),
            "path": rel_path,
            "machine_id": self.machine_id,
        });
        if let (Value::Object(map), Value::Object(extra_obj)) = (&mut payload, tagged_fields(extra)) {
            for (key, value) in extra_obj {
                map.insert(key, value);
            }
        }

        let outcome = self
            .post_json_with_retry(
                "/operate",
                &payload,
                Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            )
            .await;
        outcome.ok
    }

    #[instrument(skip(self))]
    async fn check_integrity(&self, rel_path: &str, md5: &str) -> Option<Value> {
        let payload = serde_json::json!({
            "relative_path": rel_path,
            "md5": md5,
            "machine_id": self.machine_id,
        });
        let outcome = self
            .post_json_with_retry(
                "/check_integrity",
                &payload,
                Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            )
            .await;
        if outcome.ok { outcome.body } else { None }
    }

    #[instrument(skip(self, progress), fields(rel_path = %rel_path, md5 = %md5))]
    async fn upload_file_chunked(
        &self,
        local_path: &Path,
        rel_path: &str,
        md5: &str,
        mtime: f64,
        progress: ProgressCallback<'_>,
    ) -> UploadResult {
        let file_size = match tokio::fs::metadata(local_path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(error = %err, "could not stat file before upload");
                return UploadResult {
                    success: false,
                    http_status: 500,
                };
            }
        };

        let total_chunks = file_size.div_ceil(self.chunk_size).max(if file_size == 0 { 0 } else { 1 });
        let already_received = self.probe_chunks(md5).await;

        info!(
            rel_path,
            size_mb = file_size as f64 / 1024.0 / 1024.0,
            total_chunks,
            already_received = already_received.len(),
            "starting upload"
        );

        let mut file = match tokio::fs::File::open(local_path).await {
            Ok(f) => f,
            Err(err) => {
                warn!(error = %err, "could not open file for chunked upload");
                return UploadResult {
                    success: false,
                    http_status: 500,
                };
            }
        };

        for chunk_index in 0..total_chunks {
            if already_received.contains(&chunk_index) {
                progress(chunk_index + 1, total_chunks);
                continue;
            }

            if file
                .seek(std::io::SeekFrom::Start(chunk_index * self.chunk_size))
                .await
                .is_err()
            {
                return UploadResult {
                    success: false,
                    http_status: 400,
                };
            }

            let this_chunk_len = self.chunk_size.min(file_size - chunk_index * self.chunk_size);
            let mut buf = vec![0u8; usize::try_from(this_chunk_len).unwrap_or(usize::MAX)];
            if file.read_exact(&mut buf).await.is_err() {
                return UploadResult {
                    success: false,
                    http_status: 400,
                };
            }

            if !self
                .upload_single_chunk(buf, chunk_index, total_chunks, md5, rel_path)
                .await
            {
                return UploadResult {
                    success: false,
                    http_status: 400,
                };
            }

            progress(chunk_index + 1, total_chunks);
        }

        self.merge_chunks(rel_path, md5, mtime).await
    }
}

impl HttpUploader {
    #[instrument(skip(self))]
    async fn probe_chunks(&self, md5: &str) -> std::collections::HashSet<u64> {
        let payload = serde_json::json!({ "md5": md5 });
        let outcome = self
            .post_json_with_retry(
                "/upload/check",
                &payload,
                Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            )
            .await;

        outcome
            .body
            .as_ref()
            .and_then(|b| b.get("chunks"))
            .and_then(Value::as_array)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter_map(Value::as_u64)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[instrument(skip(self, data))]
    async fn upload_single_chunk(
        &self,
        data: Vec<u8>,
        chunk_index: u64,
        total_chunks: u64,
        md5: &str,
        rel_path: &str,
    ) -> bool {
        let url = self.url("/upload/chunk");
        let mut attempt = 0u32;

        loop {
            let form = reqwest::multipart::Form::new()
                .part("file", reqwest::multipart::Part::bytes(data.clone()))
                .text("chunk_index", chunk_index.to_string())
                .text("total_chunks", total_chunks.to_string())
                .text("md5", md5.to_string())
                .text("relative_path", rel_path.to_string())
                .text("machine_id", self.machine_id.clone());

            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.auth_token)
                .timeout(Duration::from_secs(CHUNK_TIMEOUT_SECS))
                .multipart(form)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    let status = response.status();
                    if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt < self.max_retries
                    {
                        attempt += 1;
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    warn!(chunk_index, status = status.as_u16(), "chunk upload failed");
                    return false;
                }
                Err(err) => {
                    warn!(chunk_index, error = %err, "chunk upload failed");
                    return false;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn merge_chunks(&self, rel_path: &str, md5: &str, mtime: f64) -> UploadResult {
        let payload = serde_json::json!({
            "relative_path": rel_path,
            "md5": md5,
            "mtime": mtime,
            "machine_id": self.machine_id,
        });

        let outcome = self
            .post_json_with_retry("/upload/merge", &payload, Duration::from_secs(MERGE_TIMEOUT_SECS))
            .await;

        match outcome.status {
            Some(status) if outcome.ok => {
                debug!(rel_path, status, "merge succeeded");
                UploadResult {
                    success: true,
                    http_status: status,
                }
            }
            Some(status) => UploadResult {
                success: false,
                http_status: status,
            },
            None => UploadResult {
                success: false,
                http_status: 500,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn noop_progress() -> impl Fn(u64, u64) + Send + Sync {
        |_, _| {}
    }

    async fn uploader_for(server: &MockServer) -> HttpUploader {
        HttpUploader::new(
            format!("{}/api", server.uri()),
            "test-token".to_string(),
            "test-machine".to_string(),
            3,
            4,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_audit_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/audit"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let uploader = uploader_for(&server).await;
        let audit = TaskExtra::Audit {
            id: "1".to_string(),
            timestamp: "now".to_string(),
            machine_id: "test-machine".to_string(),
            event: "CREATED".to_string(),
            path: "a.txt".to_string(),
            old_path: None,
        };
        assert!(uploader.send_audit(&audit).await);
    }

    #[tokio::test]
    async fn check_integrity_returns_none_on_transport_failure() {
        let uploader = HttpUploader::new(
            "http://127.0.0.1:1/api".to_string(),
            "token".to_string(),
            "machine".to_string(),
            0,
            4,
        )
        .unwrap();
        assert!(uploader.check_integrity("a.txt", "abc").await.is_none());
    }

    #[tokio::test]
    async fn small_file_upload_probes_uploads_one_chunk_then_merges() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"chunks": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/chunk"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/merge"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let uploader = uploader_for(&server).await;
        let progress = noop_progress();
        let result = uploader
            .upload_file_chunked(&file_path, "a.txt", "5d41402abc4b2a76b9719d911017c592", 0.0, &progress)
            .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn resumed_upload_skips_already_received_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"chunks": [0, 1]})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/chunk"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/merge"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("big.bin");
        std::fs::write(&file_path, vec![0u8; 12]).unwrap();

        // chunk_size = 4 bytes => 3 total chunks, chunks 0 and 1 already received.
        let uploader = uploader_for(&server).await;
        let progress = noop_progress();
        let result = uploader
            .upload_file_chunked(&file_path, "big.bin", "ignored-in-mock", 0.0, &progress)
            .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn chunk_failure_aborts_with_synthetic_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"chunks": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/chunk"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let uploader = uploader_for(&server).await;
        let progress = noop_progress();
        let result = uploader
            .upload_file_chunked(&file_path, "a.txt", "abc", 0.0, &progress)
            .await;

        assert!(!result.success);
        assert_eq!(result.http_status, 400);
    }

    #[tokio::test]
    async fn empty_file_uploads_zero_chunks_then_merges() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"chunks": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/chunk"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload/merge"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("empty.txt");
        std::fs::write(&file_path, b"").unwrap();

        let uploader = uploader_for(&server).await;
        let progress = noop_progress();
        let result = uploader
            .upload_file_chunked(&file_path, "empty.txt", "d41d8cd98f00b204e9800998ecf8427e", 0.0, &progress)
            .await;

        assert!(result.success);
    }
}
