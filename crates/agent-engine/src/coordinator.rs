use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode, redirect};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use bk_agent_core::AgentConfig;

use crate::state::AgentShared;

const POST_TIMEOUT: Duration = Duration::from_secs(60);
const GET_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Heartbeat wire version.
const AGENT_VERSION: &str = "2.0";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error(
        "redirect ({status}) from {endpoint}: the coordinator must not redirect /api/* traffic; \
         fix the domain rule so API calls reach the worker directly"
    )]
    Redirect { endpoint: String, status: StatusCode },
    #[error("HTTP {status} from {endpoint}")]
    Status { endpoint: String, status: StatusCode },
    #[error("non-JSON response from {endpoint} (content-type {content_type:?})")]
    NotJson {
        endpoint: String,
        content_type: String,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl ApiError {
    /// Whether this failure counts as "the coordinator did not respond" for
    /// deep-sleep escalation. 4xx and malformed bodies are responses.
    pub(crate) fn is_no_response(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => status.is_server_error(),
            ApiError::Redirect { .. } | ApiError::NotJson { .. } => false,
        }
    }
}

/// One claimed job as returned by the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobDescriptor {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) clean_name: String,
    #[serde(default = "default_quality")]
    pub(crate) quality: String,
    #[serde(default = "default_profile")]
    pub(crate) processing_profile: String,
    #[serde(default)]
    pub(crate) source_url: Option<String>,
    #[serde(default)]
    pub(crate) download_url: Option<String>,
    #[serde(default)]
    pub(crate) r2_raw_key: Option<String>,
    #[serde(default)]
    pub(crate) processing_checkpoint: Option<String>,
    #[serde(default)]
    pub(crate) file_size_input: Option<u64>,
}

fn default_quality() -> String {
    "720p".to_string()
}

fn default_profile() -> String {
    "crf_14".to_string()
}

impl JobDescriptor {
    /// True when the raw source is already mirrored into coordinator-controlled
    /// storage, so the external fetch can be skipped.
    pub(crate) fn resumable(&self) -> bool {
        let checkpoint_done =
            self.processing_checkpoint.as_deref().map(str::trim) == Some("download_done");
        let raw_key_real = matches!(
            self.r2_raw_key.as_deref().map(str::trim),
            Some(key) if !key.is_empty() && key != "url-import-pending"
        );
        checkpoint_done && raw_key_real
    }
}

/// Result metrics reported with `jobs/complete`.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompletionReport {
    pub(crate) public_url: String,
    pub(crate) file_size_output: u64,
    pub(crate) duration: i64,
    pub(crate) processing_time_seconds: u64,
    pub(crate) resolution: String,
    pub(crate) bitrate: u64,
    pub(crate) codec: String,
    pub(crate) frame_rate: f64,
    pub(crate) audio_codec: String,
    pub(crate) audio_bitrate: u32,
    pub(crate) ffmpeg_command: String,
    pub(crate) ffmpeg_output: String,
    pub(crate) thumbnail_key: Option<String>,
    pub(crate) clean_name: String,
}

/// JSON-over-HTTPS client for the coordinator API. Stateless; every call
/// carries bearer auth, the worker identity header and the client version.
/// Redirects are never followed: a 3xx means the API route is misconfigured.
pub(crate) struct CoordinatorClient {
    http: reqwest::Client,
    base: String,
    worker_id: String,
}

impl CoordinatorClient {
    pub(crate) fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(format!("bk-agent/{}", env!("CARGO_PKG_VERSION")))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", cfg.bearer_token).parse()?,
                );
                headers.insert("x-worker-id", cfg.worker_id.parse()?);
                headers
            })
            .build()?;
        Ok(Self {
            http,
            base: cfg.api_base().to_string(),
            worker_id: cfg.worker_id.clone(),
        })
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, ApiError> {
        let timeout = if method == Method::GET { GET_TIMEOUT } else { POST_TIMEOUT };
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base, endpoint))
            .timeout(timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let res = req.send().await?;
        let status = res.status();
        if status.is_redirection() {
            return Err(ApiError::Redirect {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let bytes = res.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        if !content_type.contains("application/json") {
            return Err(ApiError::NotJson {
                endpoint: endpoint.to_string(),
                content_type,
            });
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| ApiError::NotJson {
                endpoint: endpoint.to_string(),
                content_type,
            })
    }

    /// POST expecting a JSON payload back. Failures are logged and flatten to
    /// `None`; transport problems never propagate to the job pipeline.
    async fn post_json(&self, endpoint: &str, body: Value) -> Option<Value> {
        match self.request(Method::POST, endpoint, Some(body)).await {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(endpoint, error = %err, "coordinator POST failed");
                None
            }
        }
    }

    /// POST where only success/failure matters (2xx with or without a body).
    async fn post_ok(&self, endpoint: &str, body: Value) -> bool {
        match self.request(Method::POST, endpoint, Some(body)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(endpoint, error = %err, "coordinator POST failed");
                false
            }
        }
    }

    pub(crate) async fn claim_job(&self) -> Option<JobDescriptor> {
        let value = self
            .post_json("/api/jobs/claim", json!({ "worker_id": self.worker_id }))
            .await?;
        if value.get("id").and_then(Value::as_i64).is_none() {
            return None;
        }
        match serde_json::from_value::<JobDescriptor>(value) {
            Ok(job) => Some(job),
            Err(err) => {
                tracing::error!(error = %err, "claim returned an unreadable job descriptor");
                None
            }
        }
    }

    pub(crate) async fn update_status(&self, job_id: i64, status: &str) -> bool {
        self.post_ok(
            "/api/jobs/status",
            json!({ "job_id": job_id, "worker_id": self.worker_id, "status": status }),
        )
        .await
    }

    pub(crate) async fn download_progress(&self, job_id: i64, downloaded: u64, total: u64) {
        let pct = if total > 0 {
            (downloaded as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        self.post_ok(
            "/api/jobs/status",
            json!({
                "job_id": job_id,
                "worker_id": self.worker_id,
                "status": "DOWNLOADING",
                "download_bytes": downloaded,
                "download_total": total,
                "download_progress": pct,
            }),
        )
        .await;
    }

    /// Fire-and-forget checkpoint persistence.
    pub(crate) async fn update_checkpoint(&self, job_id: i64, checkpoint: &str) {
        self.post_ok(
            "/api/jobs/checkpoint",
            json!({ "job_id": job_id, "worker_id": self.worker_id, "checkpoint": checkpoint }),
        )
        .await;
    }

    pub(crate) async fn url_import_done(&self, job_id: i64, r2_raw_key: &str, file_size: u64) -> bool {
        self.post_ok(
            "/api/jobs/url-import-done",
            json!({
                "job_id": job_id,
                "worker_id": self.worker_id,
                "r2_raw_key": r2_raw_key,
                "file_size_input": file_size,
            }),
        )
        .await
    }

    /// Request a presigned PUT URL for `key` in `bucket`.
    pub(crate) async fn presigned_upload(
        &self,
        job_id: i64,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Option<String> {
        let value = self
            .post_json(
                "/api/jobs/presigned-upload",
                json!({
                    "job_id": job_id,
                    "worker_id": self.worker_id,
                    "bucket": bucket,
                    "key": key,
                    "content_type": content_type,
                }),
            )
            .await?;
        value
            .get("upload_url")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub(crate) async fn complete_job(&self, job_id: i64, report: &CompletionReport) -> bool {
        let mut body = match serde_json::to_value(report) {
            Ok(Value::Object(map)) => map,
            _ => return false,
        };
        body.insert("job_id".into(), json!(job_id));
        body.insert("worker_id".into(), json!(self.worker_id));
        self.post_ok("/api/jobs/complete", Value::Object(body)).await
    }

    pub(crate) async fn fail_job(
        &self,
        job_id: i64,
        error_message: &str,
        stage: &str,
        ffmpeg_output: &str,
    ) -> bool {
        let truncated: String = ffmpeg_output.chars().take(4000).collect();
        self.post_ok(
            "/api/jobs/fail",
            json!({
                "job_id": job_id,
                "worker_id": self.worker_id,
                "error_message": error_message,
                "retry_count": 0,
                "status": "FAILED",
                "stage": stage,
                "ffmpeg_output": truncated,
            }),
        )
        .await
    }

    pub(crate) async fn interrupt_job(&self, job_id: i64, stage: &str) {
        self.post_ok(
            "/api/jobs/interrupt",
            json!({ "job_id": job_id, "worker_id": self.worker_id, "stage": stage }),
        )
        .await;
    }

    /// Best-effort nudge letting the coordinator time out stale leases.
    pub(crate) async fn mark_zombies(&self) {
        self.post_ok("/api/jobs/mark-zombies", json!({})).await;
    }

    pub(crate) async fn interrupted_job_ids(&self) -> Vec<i64> {
        let value = match self
            .request(Method::GET, "/api/jobs/interrupted?limit=100", None)
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "interrupted-jobs fetch failed");
                return Vec::new();
            }
        };
        value
            .get("jobs")
            .and_then(Value::as_array)
            .map(|jobs| {
                jobs.iter()
                    .filter_map(|job| job.get("id").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns how many interrupted jobs the coordinator re-queued.
    pub(crate) async fn retry_interrupted(&self, job_ids: &[i64]) -> Option<i64> {
        let value = self
            .post_json("/api/jobs/interrupted/retry", json!({ "job_ids": job_ids }))
            .await?;
        value.get("retried").and_then(Value::as_i64)
    }

    pub(crate) async fn send_heartbeat(
        &self,
        shared: &Arc<AgentShared>,
        status: &str,
    ) -> Result<(), ApiError> {
        let (current_job_id, active_jobs) = {
            let state = shared.lock_state();
            (
                state.active_jobs.keys().next().copied(),
                state.active_jobs.len(),
            )
        };
        let body = json!({
            "status": status,
            "current_job_id": current_job_id,
            "active_jobs": active_jobs,
            "queue_size": shared.queue_depth.load(std::sync::atomic::Ordering::SeqCst),
            "ip_address": local_ip(),
            "version": AGENT_VERSION,
        });
        self.request(Method::POST, "/api/heartbeat", Some(body))
            .await
            .map(|_| ())
    }

    pub(crate) async fn system_alert(&self, status: &str, message: &str) {
        self.post_ok(
            "/api/system/alerts",
            json!({ "status": status, "message": message }),
        )
        .await;
    }

    /// Ping telemetry authenticated by the shared secret instead of the bearer
    /// token.
    pub(crate) async fn samaritan_ping(&self, secret: &str, payload: Value) -> bool {
        let res = self
            .http
            .post(format!("{}/api/samaritan/ping", self.base))
            .header("X-Samaritan-Secret", secret)
            .timeout(PING_TIMEOUT)
            .json(&payload)
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => true,
            Ok(res) => {
                tracing::debug!(status = %res.status(), "samaritan ping rejected");
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "samaritan ping failed");
                false
            }
        }
    }
}

/// Outbound interface address, discovered with a UDP connect probe (no packet
/// is sent).
fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(checkpoint: Option<&str>, raw_key: Option<&str>) -> JobDescriptor {
        JobDescriptor {
            id: 1,
            clean_name: "a.mp4".into(),
            quality: default_quality(),
            processing_profile: default_profile(),
            source_url: None,
            download_url: None,
            r2_raw_key: raw_key.map(str::to_string),
            processing_checkpoint: checkpoint.map(str::to_string),
            file_size_input: None,
        }
    }

    #[test]
    fn resumable_requires_checkpoint_and_real_key() {
        assert!(job(Some("download_done"), Some("raw-uploads/1-1-a.mp4")).resumable());
        assert!(!job(Some("download_done"), Some("url-import-pending")).resumable());
        assert!(!job(Some("download_done"), Some("")).resumable());
        assert!(!job(Some("download_done"), None).resumable());
        assert!(!job(None, Some("raw-uploads/1-1-a.mp4")).resumable());
        assert!(!job(Some(""), Some("raw-uploads/1-1-a.mp4")).resumable());
    }

    #[test]
    fn descriptor_defaults_fill_missing_fields() {
        let job: JobDescriptor = serde_json::from_value(json!({
            "id": 101,
            "clean_name": "a.mp4",
        }))
        .expect("minimal descriptor must parse");
        assert_eq!(job.quality, "720p");
        assert_eq!(job.processing_profile, "crf_14");
        assert!(job.source_url.is_none());
    }

    #[test]
    fn no_response_classification() {
        let transport_like = ApiError::Status {
            endpoint: "/api/heartbeat".into(),
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(transport_like.is_no_response());

        let rejected = ApiError::Status {
            endpoint: "/api/heartbeat".into(),
            status: StatusCode::FORBIDDEN,
        };
        assert!(!rejected.is_no_response());

        let redirected = ApiError::Redirect {
            endpoint: "/api/heartbeat".into(),
            status: StatusCode::FOUND,
        };
        assert!(!redirected.is_no_response());
    }
}
