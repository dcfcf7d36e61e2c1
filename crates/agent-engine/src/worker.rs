//! Worker pool: one task per slot, each executing the per-job pipeline
//! (resolve source → transcode → upload → thumbnail → complete) in strict
//! order. A worker owns every `active_jobs`/`active_procs` entry it creates.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};

use bk_agent_core::AgentConfig;

use crate::alerts::AlertChannel;
use crate::coordinator::{CompletionReport, CoordinatorClient, JobDescriptor};
use crate::download::Downloader;
use crate::state::AgentShared;
use crate::transcode::{
    TranscodeError, Transcoder, encode_mode, output_name, scale_filter, target_resolution,
};
use crate::upload::{Uploader, raw_key, thumbnail_key, video_key};

pub(crate) enum WorkerCommand {
    Job(JobDescriptor),
    /// Terminal sentinel pushed per worker on shutdown.
    Stop,
}

pub(crate) enum WorkerEvent {
    Finished { worker_idx: usize },
}

/// Shared services handed to every worker.
#[derive(Clone)]
pub(crate) struct JobServices {
    pub(crate) shared: Arc<AgentShared>,
    pub(crate) cfg: Arc<AgentConfig>,
    pub(crate) client: Arc<CoordinatorClient>,
    pub(crate) downloader: Arc<Downloader>,
    pub(crate) transcoder: Arc<Transcoder>,
    pub(crate) uploader: Arc<Uploader>,
    pub(crate) alerts: Arc<AlertChannel>,
    /// One permit: external downloads are globally serialized to bound
    /// bandwidth; transcoding and uploading are not.
    pub(crate) download_permit: Arc<Semaphore>,
}

pub(crate) async fn run_worker_task(
    worker_idx: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerEvent>,
    services: JobServices,
) {
    let worker_name = format!("worker-{}", worker_idx + 1);
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Job(job) => {
                process_job(&services, &worker_name, job).await;
                let _ = internal_tx.send(WorkerEvent::Finished { worker_idx });
            }
        }
    }
}

/// A pipeline failure with its coordinator stage tag.
struct StageError {
    stage: &'static str,
    message: String,
    ffmpeg_output: String,
}

impl StageError {
    fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            ffmpeg_output: String::new(),
        }
    }

    fn with_output(stage: &'static str, message: impl Into<String>, output: String) -> Self {
        Self {
            stage,
            message: message.into(),
            ffmpeg_output: output,
        }
    }
}

async fn process_job(services: &JobServices, worker_name: &str, job: JobDescriptor) {
    let job_id = job.id;
    services
        .shared
        .lock_state()
        .active_jobs
        .insert(job_id, worker_name.to_string());

    match run_pipeline(services, &job).await {
        Ok(report) => {
            tracing::info!(job_id, output = %report.clean_name, "job completed");
            services
                .alerts
                .asset_preview(&report.clean_name, report.duration, report.thumbnail_key.as_deref())
                .await;
        }
        Err(err) if services.shared.was_interrupted(job_id) => {
            // The watchdog already posted jobs/interrupt; a second terminal
            // call would race the coordinator's rescheduling.
            tracing::warn!(job_id, stage = err.stage, "job interrupted externally");
        }
        Err(err) => {
            tracing::error!(job_id, stage = err.stage, error = %err.message, "job failed");
            services
                .client
                .fail_job(job_id, &err.message, err.stage, &err.ffmpeg_output)
                .await;
        }
    }

    services.shared.lock_state().active_jobs.remove(&job_id);
}

async fn run_pipeline(
    services: &JobServices,
    job: &JobDescriptor,
) -> Result<CompletionReport, StageError> {
    let job_id = job.id;
    let work_dir = tempfile::Builder::new()
        .prefix(&format!("bk-{job_id}-"))
        .tempdir_in(&services.cfg.temp_dir)
        .map_err(|err| StageError::new("unknown", format!("scratch dir: {err}")))?;
    let input = work_dir.path().join("input.mp4");

    resolve_source(services, job, &input).await?;

    services.client.update_status(job_id, "CONVERTING").await;
    let meta = services.transcoder.probe_source(&input).await;
    let mode = encode_mode(&job.processing_profile);
    let scale = scale_filter(&job.quality, meta.vertical);
    let output_filename = output_name(&job.clean_name, &job.quality);
    let output_path = work_dir.path().join(&output_filename);

    let args = services
        .transcoder
        .build_args(&input, &output_path, mode, scale);
    let run = services
        .transcoder
        .run(&services.shared, job_id, &args)
        .await
        .map_err(|err| match err {
            TranscodeError::Timeout => StageError::new("convert", "FFmpeg timeout"),
            TranscodeError::Failed { output } => {
                StageError::with_output("convert", "FFmpeg failed", output)
            }
            TranscodeError::Io(err) => StageError::new("convert", err.to_string()),
        })?;

    services.client.update_status(job_id, "UPLOADING").await;
    let key = video_key(job_id, &output_filename, Utc::now());
    let public_url = services
        .uploader
        .upload(&services.client, &output_path, job_id, "public", &key, "video/mp4")
        .await
        .ok_or_else(|| StageError::new("upload", "storage upload failed"))?;

    let out_meta = services.transcoder.probe_output(&output_path).await;

    let thumb = match services
        .transcoder
        .thumbnail(&output_path, work_dir.path(), &output_filename)
        .await
    {
        Some((thumb_path, thumb_filename)) => {
            let key = thumbnail_key(job_id, &thumb_filename);
            match services
                .uploader
                .upload(&services.client, &thumb_path, job_id, "public", &key, "image/jpeg")
                .await
            {
                Some(_) => {
                    tracing::info!(job_id, key, "thumbnail generated and uploaded");
                    Some(key)
                }
                None => None,
            }
        }
        None => None,
    };

    let file_size_output = tokio::fs::metadata(&output_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let fallback_resolution = target_resolution(&job.quality, meta.vertical)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}x{}", meta.width, meta.height));

    let report = CompletionReport {
        public_url,
        file_size_output,
        duration: out_meta.duration.unwrap_or(0),
        processing_time_seconds: run.elapsed_secs,
        resolution: out_meta.resolution.unwrap_or(fallback_resolution),
        bitrate: meta.bitrate_kbps,
        codec: "h264".to_string(),
        frame_rate: out_meta.frame_rate.unwrap_or(meta.fps),
        audio_codec: "aac".to_string(),
        audio_bitrate: 128,
        ffmpeg_command: run.command_line,
        ffmpeg_output: run.output,
        thumbnail_key: thumb,
        clean_name: output_filename,
    };

    if !services.client.complete_job(job_id, &report).await {
        return Err(StageError::new("complete", "completion call failed"));
    }
    Ok(report)
}

/// Bring the input into the scratch dir, honoring the `download_done`
/// checkpoint so an externally fetched source is never pulled twice.
async fn resolve_source(
    services: &JobServices,
    job: &JobDescriptor,
    input: &Path,
) -> Result<(), StageError> {
    let resumable = job.resumable();

    if let Some(source_url) = job.source_url.as_deref() {
        if resumable {
            if let Some(download_url) = job.download_url.as_deref() {
                tracing::info!(
                    job_id = job.id,
                    key = job.r2_raw_key.as_deref().unwrap_or_default(),
                    "checkpoint download_done: fetching mirrored raw source"
                );
                return fetch_serialized(services, job.id, download_url, input).await;
            }
        }

        fetch_serialized(services, job.id, source_url, input).await?;
        let file_size = tokio::fs::metadata(input).await.map(|m| m.len()).unwrap_or(0);
        let raw = raw_key(Utc::now().timestamp(), job.id, &job.clean_name);
        if services
            .uploader
            .upload(&services.client, input, job.id, "raw", &raw, "video/mp4")
            .await
            .is_none()
        {
            return Err(StageError::new("upload", "failed to mirror raw source to storage"));
        }
        if !services.client.url_import_done(job.id, &raw, file_size).await {
            return Err(StageError::new("upload", "url-import-done failed"));
        }
        services.client.update_checkpoint(job.id, "download_done").await;
        return Ok(());
    }

    match job.download_url.as_deref() {
        Some(download_url) if resumable => {
            tracing::info!(job_id = job.id, "checkpoint download_done: re-fetching via presigned URL");
            fetch_serialized(services, job.id, download_url, input).await
        }
        Some(download_url) => {
            fetch_serialized(services, job.id, download_url, input).await?;
            services.client.update_checkpoint(job.id, "download_done").await;
            Ok(())
        }
        None => Err(StageError::new("download", "missing download_url")),
    }
}

async fn fetch_serialized(
    services: &JobServices,
    job_id: i64,
    url: &str,
    dest: &Path,
) -> Result<(), StageError> {
    let _permit = services
        .download_permit
        .acquire()
        .await
        .map_err(|_| StageError::new("download", "download slot unavailable"))?;
    services
        .downloader
        .fetch(&services.client, job_id, url, dest)
        .await
        .map_err(|err| StageError::new("download", err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_keep_stage_tags() {
        let err = StageError::new("download", "SSRF: blocked URL");
        assert_eq!(err.stage, "download");
        assert_eq!(err.message, "SSRF: blocked URL");
        assert!(err.ffmpeg_output.is_empty());

        let err = StageError::with_output("convert", "FFmpeg failed", "Error: invalid data".into());
        assert_eq!(err.stage, "convert");
        assert_eq!(err.ffmpeg_output, "Error: invalid data");
    }
}
