//! Object-storage uploads via coordinator-issued presigned PUT URLs, plus the
//! storage key and public URL conventions.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tokio_util::io::ReaderStream;

use crate::coordinator::CoordinatorClient;

const PUT_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) struct Uploader {
    http: reqwest::Client,
    cdn_base: String,
}

impl Uploader {
    pub(crate) fn new(cdn_base: String) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            cdn_base,
        })
    }

    /// Request a presigned PUT for `key` and stream the file to it. Returns
    /// the public CDN URL on success.
    pub(crate) async fn upload(
        &self,
        client: &CoordinatorClient,
        path: &Path,
        job_id: i64,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Option<String> {
        let upload_url = client
            .presigned_upload(job_id, bucket, key, content_type)
            .await?;

        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "upload open failed");
                return None;
            }
        };
        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "upload stat failed");
                return None;
            }
        };

        let res = self
            .http
            .put(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .timeout(PUT_TIMEOUT)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => Some(public_url(&self.cdn_base, key)),
            Ok(res) => {
                tracing::error!(key, status = %res.status(), "storage upload rejected");
                None
            }
            Err(err) => {
                tracing::error!(key, error = %err, "storage upload failed");
                None
            }
        }
    }
}

/// Primary output key: `videos/<YYYY>/<MM>/<job_id>_<filename>`.
pub(crate) fn video_key(job_id: i64, output_filename: &str, now: DateTime<Utc>) -> String {
    format!(
        "videos/{}/{:02}/{}_{}",
        now.year(),
        now.month(),
        job_id,
        output_filename
    )
}

/// Raw-ingest mirror key: `raw-uploads/<epoch>-<job_id>-<clean>`.
pub(crate) fn raw_key(epoch: i64, job_id: i64, clean_name: &str) -> String {
    format!("raw-uploads/{epoch}-{job_id}-{clean_name}")
}

/// Thumbnail key: `thumbnails/<job_id>/<filename>`.
pub(crate) fn thumbnail_key(job_id: i64, thumb_filename: &str) -> String {
    format!("thumbnails/{job_id}/{thumb_filename}")
}

/// Absolute HTTPS URL for a storage key. A bare CDN domain gets the scheme
/// forced so relative paths never leak into the coordinator database.
pub(crate) fn public_url(cdn_base: &str, key: &str) -> String {
    let base = cdn_base.trim_end_matches('/');
    let base = if base.starts_with("https://") || base.starts_with("http://") {
        base.to_string()
    } else {
        format!("https://{base}")
    };
    format!("{}/{}", base, key.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_shapes() {
        let march = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        assert_eq!(
            video_key(101, "a-720.mp4", march),
            "videos/2026/03/101_a-720.mp4"
        );
        assert_eq!(raw_key(1_700_000_000, 202, "b.mov"), "raw-uploads/1700000000-202-b.mov");
        assert_eq!(
            thumbnail_key(101, "a-720-thumb.jpg"),
            "thumbnails/101/a-720-thumb.jpg"
        );
    }

    #[test]
    fn public_urls_are_absolute_https() {
        assert_eq!(
            public_url("https://cdn.example.tr/", "/videos/a.mp4"),
            "https://cdn.example.tr/videos/a.mp4"
        );
        assert_eq!(
            public_url("cdn.example.tr", "videos/a.mp4"),
            "https://cdn.example.tr/videos/a.mp4"
        );
        assert_eq!(
            public_url("http://cdn.example.tr", "videos/a.mp4"),
            "http://cdn.example.tr/videos/a.mp4"
        );
    }
}
