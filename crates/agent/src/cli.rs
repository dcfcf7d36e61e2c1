use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use bk_agent_core::AgentConfig;
use bk_agent_core::config::parse_truthy;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "bk-agent", version, about = "Distributed video-transcoding worker agent")]
pub struct Cli {
    /// Coordinator API root.
    #[arg(long, env = "BK_API_BASE_URL", default_value = "https://v.bilgekarga.tr")]
    pub api_base_url: String,

    /// Bearer token for the coordinator and the wakeup endpoint (required).
    #[arg(long, env = "BK_BEARER_TOKEN", default_value = "", hide_env_values = true)]
    pub bearer_token: String,

    /// Worker identity; auto-generated when empty.
    #[arg(long, env = "BK_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// Scratch root for per-job work directories.
    #[arg(long, env = "TEMP_DIR", default_value = "/tmp/video-processing")]
    pub temp_dir: PathBuf,

    /// Worker-pool size override (derived from CPU/RAM when unset).
    #[arg(long, env = "MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    /// ACTIVE tier wait between claim ticks (seconds).
    #[arg(long, env = "ACTIVE_WAIT", default_value_t = 60)]
    pub active_wait: u64,

    /// How long a wakeup or accepted job keeps the agent ACTIVE (seconds).
    #[arg(long, env = "ACTIVE_GEAR_DURATION", default_value_t = 300)]
    pub active_gear_duration: u64,

    /// IDLE tier wait (seconds).
    #[arg(long, env = "IDLE_WAIT", default_value_t = 3600)]
    pub idle_wait: u64,

    /// Heartbeat cadence outside ACTIVE (seconds).
    #[arg(long, env = "IDLE_HEARTBEAT_INTERVAL", default_value_t = 3600)]
    pub idle_heartbeat_interval: u64,

    /// Idle time before the first deep-sleep tier (seconds).
    #[arg(long, env = "IDLE_TO_DEEP_THRESHOLD", default_value_t = 7200)]
    pub idle_to_deep_threshold: u64,

    /// First deep-sleep tier wait (seconds).
    #[arg(long, env = "DEEP1_WAIT", default_value_t = 21600)]
    pub deep1_wait: u64,

    /// Second deep-sleep tier wait (seconds).
    #[arg(long, env = "DEEP2_WAIT", default_value_t = 86400)]
    pub deep2_wait: u64,

    #[arg(long, env = "WAKEUP_PORT", default_value_t = 8080)]
    pub wakeup_port: u16,

    /// Background heartbeat period (seconds).
    #[arg(long, env = "STEALTH_HEARTBEAT_INTERVAL", default_value_t = 600)]
    pub stealth_heartbeat_interval: u64,

    /// Local-processing size limit (bytes).
    #[arg(long, env = "MAX_FILE_SIZE", default_value_t = GIB)]
    pub max_file_size: u64,

    /// Hard cap on a single URL download (bytes).
    #[arg(long, env = "MAX_URL_DOWNLOAD_BYTES", default_value_t = 5 * GIB)]
    pub max_url_download_bytes: u64,

    /// Wall-clock limit for one transcoder run (minutes).
    #[arg(long, env = "TIMEOUT_MINUTES", default_value_t = 60)]
    pub timeout_minutes: u64,

    #[arg(long, env = "RAM_WARNING_GB", default_value_t = 28.0)]
    pub ram_warning_gb: f64,

    #[arg(long, env = "RAM_CRITICAL_GB", default_value_t = 31.5)]
    pub ram_critical_gb: f64,

    /// Thumbnail scale filter expression (passed to the transcoder verbatim).
    #[arg(long, env = "THUMBNAIL_SCALE", default_value = "360:-2")]
    pub thumbnail_scale: String,

    /// Public CDN root used to form result URLs.
    #[arg(long, env = "CDN_BASE_URL", default_value = "https://cdn.bilgekarga.tr")]
    pub cdn_base_url: String,

    #[arg(long, env = "TELEGRAM_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// The single chat identity allowed to issue remote commands.
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    /// Backoff between command-feed polls after transient errors (seconds).
    #[arg(long, env = "TELEGRAM_POLL_INTERVAL", default_value_t = 5)]
    pub telegram_poll_interval: u64,

    /// Shadow webhook receiving alerts when the chat channel fails.
    #[arg(long, env = "FALLBACK_WEBHOOK_URL")]
    pub fallback_webhook_url: Option<String>,

    #[arg(long, env = "SAMARITAN_SECRET", hide_env_values = true)]
    pub samaritan_secret: Option<String>,

    /// Routine status report period (seconds).
    #[arg(long, env = "SAMARITAN_STATUS_INTERVAL", default_value_t = 21600)]
    pub status_interval: u64,

    /// Ping telemetry period (seconds).
    #[arg(long, env = "SAMARITAN_PING_INTERVAL", default_value_t = 300)]
    pub ping_interval: u64,

    /// Retry interrupted jobs automatically on startup (1|true|yes).
    #[arg(long, env = "AUTO_RESUME_INTERRUPTED", default_value = "")]
    pub auto_resume_interrupted: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "debug")]
    pub log_level: String,

    /// Log file path; stderr only when unset.
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> AgentConfig {
        AgentConfig {
            api_base_url: self.api_base_url,
            bearer_token: self.bearer_token.trim().to_string(),
            worker_id: self
                .worker_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(generate_worker_id),
            ffmpeg_path: self.ffmpeg_path,
            temp_dir: self.temp_dir,
            max_concurrent_jobs: self.max_concurrent_jobs,
            active_wait: Duration::from_secs(self.active_wait),
            active_gear_duration: Duration::from_secs(self.active_gear_duration),
            idle_wait: Duration::from_secs(self.idle_wait),
            idle_heartbeat_interval: Duration::from_secs(self.idle_heartbeat_interval),
            idle_to_deep_threshold: Duration::from_secs(self.idle_to_deep_threshold),
            deep1_wait: Duration::from_secs(self.deep1_wait),
            deep2_wait: Duration::from_secs(self.deep2_wait),
            wakeup_port: self.wakeup_port,
            stealth_heartbeat_interval: Duration::from_secs(self.stealth_heartbeat_interval),
            max_file_size: self.max_file_size,
            max_url_download_bytes: self.max_url_download_bytes,
            job_timeout: Duration::from_secs(self.timeout_minutes * 60),
            ram_warning_gb: self.ram_warning_gb,
            ram_critical_gb: self.ram_critical_gb,
            thumbnail_scale: self.thumbnail_scale,
            cdn_base_url: self.cdn_base_url,
            telegram_token: self.telegram_token.filter(|s| !s.trim().is_empty()),
            telegram_chat_id: self.telegram_chat_id.filter(|s| !s.trim().is_empty()),
            telegram_poll_interval: Duration::from_secs(self.telegram_poll_interval),
            fallback_webhook_url: self.fallback_webhook_url.filter(|s| !s.trim().is_empty()),
            samaritan_secret: self.samaritan_secret.filter(|s| !s.trim().is_empty()),
            status_interval: Duration::from_secs(self.status_interval),
            ping_interval: Duration::from_secs(self.ping_interval),
            auto_resume_interrupted: parse_truthy(&self.auto_resume_interrupted),
        }
    }
}

/// `agent-<8 hex chars>` from the clock and pid; stable enough for a lease
/// identity without pulling in a randomness dependency.
fn generate_worker_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let tag = (nanos ^ u64::from(std::process::id()).rotate_left(32)) as u32;
    format!("agent-{tag:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bk-agent").chain(args.iter().copied()))
            .expect("cli must parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = parse(&[]).into_config();
        assert_eq!(cfg.active_wait, Duration::from_secs(60));
        assert_eq!(cfg.active_gear_duration, Duration::from_secs(300));
        assert_eq!(cfg.idle_wait, Duration::from_secs(3600));
        assert_eq!(cfg.idle_to_deep_threshold, Duration::from_secs(7200));
        assert_eq!(cfg.deep1_wait, Duration::from_secs(21600));
        assert_eq!(cfg.deep2_wait, Duration::from_secs(86400));
        assert_eq!(cfg.job_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_url_download_bytes, 5 * GIB);
        assert_eq!(cfg.ram_warning_gb, 28.0);
        assert_eq!(cfg.ram_critical_gb, 31.5);
        assert_eq!(cfg.thumbnail_scale, "360:-2");
        assert!(!cfg.auto_resume_interrupted);
        assert!(cfg.telegram_token.is_none());
    }

    #[test]
    fn worker_id_generated_when_blank() {
        let cfg = parse(&["--worker-id", "  "]).into_config();
        assert!(cfg.worker_id.starts_with("agent-"));
        let cfg = parse(&["--worker-id", "node-7"]).into_config();
        assert_eq!(cfg.worker_id, "node-7");
    }

    #[test]
    fn truthy_auto_resume() {
        assert!(parse(&["--auto-resume-interrupted", "yes"]).into_config().auto_resume_interrupted);
        assert!(!parse(&["--auto-resume-interrupted", "off"]).into_config().auto_resume_interrupted);
    }
}
