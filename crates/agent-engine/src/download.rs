//! Streaming HTTP downloader: size-capped, disk-guarded, `.part`-staged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use bk_agent_core::Telemetry;

use crate::coordinator::CoordinatorClient;
use crate::ssrf::{SsrfGuard, transform_source_url};

#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadError {
    #[error("SSRF: blocked URL")]
    Blocked,
    #[error("download size limit exceeded")]
    SizeLimit,
    #[error("insufficient disk space (need 2x the file size)")]
    DiskSpace,
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download failed: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) struct Downloader {
    http: reqwest::Client,
    guard: SsrfGuard,
    telemetry: Arc<Telemetry>,
    max_bytes: u64,
}

impl Downloader {
    /// The download client follows redirects (unlike the coordinator client):
    /// object stores and file hosts answer GETs with signed redirects.
    pub(crate) fn new(
        guard: SsrfGuard,
        telemetry: Arc<Telemetry>,
        max_bytes: u64,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            guard,
            telemetry,
            max_bytes,
        })
    }

    /// HEAD probe of the transformed URL; `None` when the server does not
    /// advertise a length.
    pub(crate) async fn probe_content_length(&self, url: &str) -> Option<u64> {
        let transformed = transform_source_url(&self.http, url).await;
        let res = self
            .http
            .head(&transformed)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .ok()?;
        if res.status() != reqwest::StatusCode::OK {
            return None;
        }
        res.content_length().or_else(|| {
            res.headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        })
    }

    /// Download `url` to `dest`, streaming through a `.part` sibling that is
    /// renamed into place only on success. On any failure nothing remains at
    /// `dest` and the partial file is unlinked.
    pub(crate) async fn fetch(
        &self,
        client: &CoordinatorClient,
        job_id: i64,
        url: &str,
        dest: &Path,
    ) -> Result<(), DownloadError> {
        if !self.guard.validate(url).await {
            return Err(DownloadError::Blocked);
        }
        let transformed = transform_source_url(&self.http, url).await;

        let content_length = self.probe_content_length(&transformed).await;
        if let Some(len) = content_length {
            if len > self.max_bytes {
                return Err(DownloadError::SizeLimit);
            }
        }

        // Admission: the scratch disk must hold the input plus the transcoded
        // output, so require twice the (known or assumed-worst) input size.
        let expected = content_length.unwrap_or(self.max_bytes);
        match self.telemetry.disk_free_bytes() {
            Some(free) if free < expected.saturating_mul(2) => {
                return Err(DownloadError::DiskSpace);
            }
            Some(_) => {}
            None => tracing::warn!("disk admission check skipped: scratch mount not found"),
        }

        client.update_status(job_id, "DOWNLOADING").await;

        let part = part_path(dest);
        let result = self
            .stream_to_part(client, job_id, &transformed, content_length, &part)
            .await;
        match result {
            Ok(()) => match tokio::fs::rename(&part, dest).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(err)
            }
        }
    }

    async fn stream_to_part(
        &self,
        client: &CoordinatorClient,
        job_id: i64,
        url: &str,
        head_length: Option<u64>,
        part: &Path,
    ) -> Result<(), DownloadError> {
        let mut res = self.http.get(url).send().await?.error_for_status()?;
        let total = head_length.or(res.content_length()).unwrap_or(0);
        if total > self.max_bytes {
            return Err(DownloadError::SizeLimit);
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut downloaded: u64 = 0;
        let mut last_pct = -1.0_f64;
        while let Some(chunk) = res.chunk().await? {
            downloaded += chunk.len() as u64;
            if downloaded > self.max_bytes {
                return Err(DownloadError::SizeLimit);
            }
            file.write_all(&chunk).await?;

            // Progress at every ~10% crossing and near completion.
            let pct = if total > 0 {
                ((downloaded as f64 / total as f64) * 1000.0).round() / 10.0
            } else {
                0.0
            };
            if pct != last_pct && (pct as i64 % 10 == 0 || pct >= 99.0) {
                client.download_progress(job_id, downloaded, total).await;
                last_pct = pct;
            }
        }
        file.flush().await?;
        Ok(())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_sibling_of_destination() {
        assert_eq!(
            part_path(Path::new("/tmp/work/input.mp4")),
            Path::new("/tmp/work/input.mp4.part")
        );
    }
}
