//! Transcoder driver: source probing, parameter-list construction, and the
//! priority-reduced subprocess lifecycle (timeout, stderr capture, watchdog
//! pid registration).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use bk_agent_core::config::{DEFAULT_CRF, LEGACY_CRF_MAP};

use crate::state::AgentShared;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub(crate) enum TranscodeError {
    #[error("FFmpeg timeout")]
    Timeout,
    #[error("FFmpeg failed")]
    Failed { output: String },
    #[error("transcode failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How the video stream is produced for a given processing profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeMode {
    /// Stream-copy the video (web-optimize profiles); no scaling, no CRF.
    Copy,
    /// Re-encode at this constant quality level.
    Crf(u32),
}

/// Profile name to encode mode. `crf_<n>` profiles carry their level in the
/// name; legacy keywords map through a fixed table; anything unreadable falls
/// back to the default level.
pub(crate) fn encode_mode(profile: &str) -> EncodeMode {
    let profile = profile.trim();
    if matches!(profile, "web_opt" | "web_optimize") {
        return EncodeMode::Copy;
    }
    if let Some(level) = profile.strip_prefix("crf_") {
        return EncodeMode::Crf(level.parse().unwrap_or(DEFAULT_CRF));
    }
    let crf = LEGACY_CRF_MAP
        .iter()
        .find(|(name, _)| *name == profile)
        .map(|(_, crf)| *crf)
        .unwrap_or(DEFAULT_CRF);
    EncodeMode::Crf(crf)
}

/// Scale filter for the target quality. Vertical sources pin the short edge
/// via the width; `original` (and unknown qualities) keep source dimensions.
pub(crate) fn scale_filter(quality: &str, vertical: bool) -> Option<&'static str> {
    let (vert, horiz) = match quality {
        "720p" => ("scale=720:-2:flags=lanczos", "scale=-2:720:flags=lanczos"),
        "1080p" => ("scale=1080:-2:flags=lanczos", "scale=-2:1080:flags=lanczos"),
        "2k" => ("scale=1440:-2:flags=lanczos", "scale=-2:1440:flags=lanczos"),
        "4k" => ("scale=2160:-2:flags=lanczos", "scale=-2:2160:flags=lanczos"),
        _ => return None,
    };
    Some(if vertical { vert } else { horiz })
}

/// Nominal output resolution for the target quality, or `None` when the
/// source dimensions are kept.
pub(crate) fn target_resolution(quality: &str, vertical: bool) -> Option<&'static str> {
    let (vert, horiz) = match quality {
        "720p" => ("720x1280", "1280x720"),
        "1080p" => ("1080x1920", "1920x1080"),
        "2k" => ("1440x2560", "2560x1440"),
        "4k" => ("2160x3840", "3840x2160"),
        _ => return None,
    };
    Some(if vertical { vert } else { horiz })
}

/// Output filename: clean stem plus a resolution suffix.
pub(crate) fn output_name(clean_name: &str, quality: &str) -> String {
    let base = clean_name.replace(".mp4", "").replace(".mov", "");
    let suffix = match quality {
        "original" => "original",
        "1080p" => "1080",
        "2k" => "2k",
        "4k" => "4k",
        _ => "720",
    };
    format!("{base}-{suffix}.mp4")
}

pub(crate) fn parse_fps(raw: &str) -> f64 {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.trim().parse().unwrap_or(0.0);
        let den: f64 = den.trim().parse().unwrap_or(0.0);
        if den == 0.0 {
            return 30.0;
        }
        return (num / den * 100.0).round() / 100.0;
    }
    raw.trim().parse().unwrap_or(30.0)
}

/// Source metadata from the probe tool, with safe defaults when probing fails.
#[derive(Debug, Clone)]
pub(crate) struct SourceMeta {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) vertical: bool,
    pub(crate) duration_sec: f64,
    pub(crate) file_bytes: u64,
    pub(crate) bitrate_kbps: u64,
    pub(crate) fps: f64,
}

impl Default for SourceMeta {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            vertical: false,
            duration_sec: 0.0,
            file_bytes: 0,
            bitrate_kbps: 0,
            fps: 30.0,
        }
    }
}

/// Probe of the finished output; any field the tool cannot report stays `None`
/// and the caller falls back to source metadata.
#[derive(Debug, Default)]
pub(crate) struct OutputMeta {
    pub(crate) resolution: Option<String>,
    pub(crate) frame_rate: Option<f64>,
    pub(crate) duration: Option<i64>,
}

/// A finished transcoder run.
pub(crate) struct TranscodeRun {
    pub(crate) command_line: String,
    pub(crate) output: String,
    pub(crate) elapsed_secs: u64,
}

pub(crate) struct Transcoder {
    ffmpeg_path: String,
    thumbnail_scale: String,
    timeout: Duration,
}

impl Transcoder {
    pub(crate) fn new(ffmpeg_path: String, thumbnail_scale: String, timeout: Duration) -> Self {
        Self {
            ffmpeg_path,
            thumbnail_scale,
            timeout,
        }
    }

    pub(crate) async fn probe_source(&self, input: &Path) -> SourceMeta {
        let mut meta = SourceMeta::default();
        meta.file_bytes = tokio::fs::metadata(input).await.map(|m| m.len()).unwrap_or(0);

        if let Some(doc) = ffprobe_json(input).await {
            if let Some(fmt) = doc.get("format") {
                meta.duration_sec = lenient_f64(fmt.get("duration"));
                let size = lenient_u64(fmt.get("size"));
                if size > 0 {
                    meta.file_bytes = size;
                }
            }
            if let Some(stream) = first_video_stream(&doc) {
                meta.width = lenient_u64(stream.get("width")) as u32;
                meta.height = lenient_u64(stream.get("height")) as u32;
                meta.vertical = meta.height > meta.width;
                let raw_bitrate = {
                    let stream_rate = lenient_u64(stream.get("bit_rate"));
                    if stream_rate > 0 {
                        stream_rate
                    } else {
                        lenient_u64(doc.get("format").and_then(|f| f.get("bit_rate")))
                    }
                };
                meta.bitrate_kbps = raw_bitrate / 1000;
                meta.fps = stream
                    .get("r_frame_rate")
                    .and_then(Value::as_str)
                    .map(parse_fps)
                    .unwrap_or(30.0);
                if meta.width == 0 {
                    meta.width = 1920;
                }
                if meta.height == 0 {
                    meta.height = 1080;
                }
            }
        }

        if meta.bitrate_kbps == 0 && meta.duration_sec > 0.0 && meta.file_bytes > 0 {
            meta.bitrate_kbps = ((meta.file_bytes as f64 * 8.0 / meta.duration_sec) as u64) / 1000;
        }
        meta
    }

    pub(crate) async fn probe_output(&self, output: &Path) -> OutputMeta {
        let mut meta = OutputMeta::default();
        let Some(doc) = ffprobe_json(output).await else {
            return meta;
        };
        if let Some(stream) = first_video_stream(&doc) {
            meta.resolution = Some(format!(
                "{}x{}",
                lenient_u64(stream.get("width")),
                lenient_u64(stream.get("height"))
            ));
            meta.frame_rate = stream
                .get("r_frame_rate")
                .and_then(Value::as_str)
                .map(parse_fps);
        }
        meta.duration = doc
            .get("format")
            .and_then(|f| f.get("duration"))
            .map(|d| lenient_f64(Some(d)) as i64);
        meta
    }

    pub(crate) fn build_args(
        &self,
        input: &Path,
        output: &Path,
        mode: EncodeMode,
        scale: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            self.ffmpeg_path.clone(),
            "-i".into(),
            input.display().to_string(),
        ];
        match mode {
            EncodeMode::Copy => {
                args.extend(["-c:v", "copy", "-an", "-movflags", "+faststart"].map(String::from));
            }
            EncodeMode::Crf(crf) => {
                if let Some(scale) = scale {
                    args.push("-vf".into());
                    args.push(scale.into());
                }
                args.extend(
                    ["-c:v", "libx264", "-crf"].map(String::from),
                );
                args.push(crf.to_string());
                args.extend(
                    [
                        "-preset", "slow", "-an", "-movflags", "+faststart", "-profile:v", "high",
                        "-level", "4.1", "-pix_fmt", "yuv420p",
                    ]
                    .map(String::from),
                );
            }
        }
        args.push("-y".into());
        args.push(output.display().to_string());
        args
    }

    /// Run one transcode. The subprocess pid is registered in `active_procs`
    /// for the duration of the wait so the watchdog can terminate it; the
    /// entry is removed on every exit path before returning.
    pub(crate) async fn run(
        &self,
        shared: &Arc<AgentShared>,
        job_id: i64,
        args: &[String],
    ) -> Result<TranscodeRun, TranscodeError> {
        let command_line = args.join(" ");
        let started = Instant::now();

        let argv = wrap_priority(args);
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            shared.lock_state().active_procs.insert(job_id, pid);
        }

        let stdout_task = read_pipe(child.stdout.take());
        let stderr_task = read_pipe(child.stderr.take());

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        shared.lock_state().active_procs.remove(&job_id);

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let output = format!("{stdout}{stderr}");

        match status {
            None => Err(TranscodeError::Timeout),
            Some(Err(err)) => Err(TranscodeError::Io(err)),
            Some(Ok(status)) if !status.success() => Err(TranscodeError::Failed { output }),
            Some(Ok(_)) => Ok(TranscodeRun {
                command_line,
                output,
                elapsed_secs: started.elapsed().as_secs(),
            }),
        }
    }

    /// Grab one frame at five seconds in, scaled per configuration.
    /// Best-effort: any failure returns `None` and the job proceeds.
    pub(crate) async fn thumbnail(
        &self,
        video: &Path,
        work_dir: &Path,
        output_filename: &str,
    ) -> Option<(PathBuf, String)> {
        let thumb_filename = output_filename.replace(".mp4", "-thumb.jpg");
        let thumb_path = work_dir.join(&thumb_filename);
        let args: Vec<String> = vec![
            self.ffmpeg_path.clone(),
            "-ss".into(),
            "00:00:05".into(),
            "-i".into(),
            video.display().to_string(),
            "-vframes".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}", self.thumbnail_scale),
            "-q:v".into(),
            "3".into(),
            "-y".into(),
            thumb_path.display().to_string(),
        ];
        let argv = wrap_priority(&args);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(THUMBNAIL_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() && thumb_path.exists() => {
                Some((thumb_path, thumb_filename))
            }
            Ok(Ok(out)) => {
                tracing::warn!(status = ?out.status, "thumbnail step skipped");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "thumbnail step skipped");
                None
            }
            Err(_) => {
                tracing::warn!("thumbnail step skipped: timeout");
                None
            }
        }
    }
}

/// Check that the transcoder binary runs at all.
pub(crate) async fn verify_binary(ffmpeg_path: &str) -> anyhow::Result<()> {
    let args = wrap_priority(&[ffmpeg_path.to_string(), "-version".to_string()]);
    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let out = tokio::time::timeout(Duration::from_secs(5), cmd.output())
        .await
        .map_err(|_| anyhow::anyhow!("transcoder check timed out"))??;
    anyhow::ensure!(out.status.success(), "transcoder binary not usable: {}", ffmpeg_path);
    Ok(())
}

/// Low CPU and idle I/O priority for media subprocesses, so interactive work
/// on the host is never starved.
#[cfg(unix)]
fn wrap_priority(args: &[String]) -> Vec<String> {
    let mut wrapped = vec![
        "ionice".to_string(),
        "-c".to_string(),
        "3".to_string(),
        "nice".to_string(),
        "-n".to_string(),
        "15".to_string(),
    ];
    wrapped.extend(args.iter().cloned());
    wrapped
}

#[cfg(not(unix))]
fn wrap_priority(args: &[String]) -> Vec<String> {
    args.to_vec()
}

fn read_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    })
}

async fn ffprobe_json(path: &Path) -> Option<Value> {
    let args: Vec<String> = vec![
        "ffprobe".into(),
        "-v".into(),
        "quiet".into(),
        "-print_format".into(),
        "json".into(),
        "-show_format".into(),
        "-show_streams".into(),
        path.display().to_string(),
    ];
    let argv = wrap_priority(&args);
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).stdin(Stdio::null());
    let out = tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await.ok()?.ok()?;
    if !out.status.success() {
        return None;
    }
    serde_json::from_slice(&out.stdout).ok()
}

fn first_video_stream(doc: &Value) -> Option<&Value> {
    doc.get("streams")?
        .as_array()?
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
}

/// ffprobe reports most numbers as JSON strings; accept either form.
fn lenient_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn lenient_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_to_encode_mode() {
        assert_eq!(encode_mode("web_opt"), EncodeMode::Copy);
        assert_eq!(encode_mode("web_optimize"), EncodeMode::Copy);
        assert_eq!(encode_mode("crf_10"), EncodeMode::Crf(10));
        assert_eq!(encode_mode("crf_abc"), EncodeMode::Crf(14));
        assert_eq!(encode_mode("crf_"), EncodeMode::Crf(14));
        assert_eq!(encode_mode("ultra"), EncodeMode::Crf(16));
        assert_eq!(encode_mode("native"), EncodeMode::Crf(14));
        assert_eq!(encode_mode("dengeli"), EncodeMode::Crf(14));
        assert_eq!(encode_mode("kucuk_dosya"), EncodeMode::Crf(18));
        assert_eq!(encode_mode("something_new"), EncodeMode::Crf(14));
    }

    #[test]
    fn scale_filters_follow_orientation() {
        assert_eq!(scale_filter("720p", false), Some("scale=-2:720:flags=lanczos"));
        assert_eq!(scale_filter("720p", true), Some("scale=720:-2:flags=lanczos"));
        assert_eq!(scale_filter("4k", false), Some("scale=-2:2160:flags=lanczos"));
        assert_eq!(scale_filter("original", false), None);
        assert_eq!(scale_filter("original", true), None);
    }

    #[test]
    fn output_names() {
        assert_eq!(output_name("a.mp4", "720p"), "a-720.mp4");
        assert_eq!(output_name("b.mov", "1080p"), "b-1080.mp4");
        assert_eq!(output_name("clip", "2k"), "clip-2k.mp4");
        assert_eq!(output_name("clip.mp4", "original"), "clip-original.mp4");
        assert_eq!(output_name("clip.mp4", "weird"), "clip-720.mp4");
    }

    #[test]
    fn fps_parsing() {
        assert_eq!(parse_fps("30"), 30.0);
        assert_eq!(parse_fps("30000/1001"), 29.97);
        assert_eq!(parse_fps("25/1"), 25.0);
        assert_eq!(parse_fps("0/0"), 30.0);
        assert_eq!(parse_fps("garbage"), 30.0);
    }

    #[test]
    fn copy_mode_args_have_no_crf() {
        let t = Transcoder::new("ffmpeg".into(), "360:-2".into(), Duration::from_secs(60));
        let args = t.build_args(
            Path::new("/w/input.mp4"),
            Path::new("/w/a-720.mp4"),
            EncodeMode::Copy,
            Some("scale=-2:720:flags=lanczos"),
        );
        assert!(args.contains(&"copy".to_string()));
        assert!(!args.iter().any(|a| a == "-crf"));
        assert!(!args.iter().any(|a| a == "-vf"));
        assert!(args.contains(&"+faststart".to_string()));
        assert!(args.contains(&"-an".to_string()));
    }

    #[test]
    fn crf_mode_args_carry_quality_and_scale() {
        let t = Transcoder::new("ffmpeg".into(), "360:-2".into(), Duration::from_secs(60));
        let args = t.build_args(
            Path::new("/w/input.mp4"),
            Path::new("/w/a-720.mp4"),
            EncodeMode::Crf(14),
            Some("scale=-2:720:flags=lanczos"),
        );
        let crf_idx = args.iter().position(|a| a == "-crf").expect("crf flag");
        assert_eq!(args[crf_idx + 1], "14");
        let vf_idx = args.iter().position(|a| a == "-vf").expect("vf flag");
        assert_eq!(args[vf_idx + 1], "scale=-2:720:flags=lanczos");
        assert!(args.contains(&"high".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/w/a-720.mp4"));
    }

    #[test]
    fn lenient_number_parsing() {
        assert_eq!(lenient_f64(Some(&serde_json::json!("12.5"))), 12.5);
        assert_eq!(lenient_f64(Some(&serde_json::json!(12.5))), 12.5);
        assert_eq!(lenient_u64(Some(&serde_json::json!("1200"))), 1200);
        assert_eq!(lenient_u64(Some(&serde_json::json!(null))), 0);
    }
}
