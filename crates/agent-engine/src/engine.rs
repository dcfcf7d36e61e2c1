//! Agent runtime: startup wiring, the four-tier polling main loop, claim
//! admission, worker assignment and graceful shutdown.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use bk_agent_core::{AgentConfig, Telemetry, config};

use crate::alerts::AlertChannel;
use crate::command;
use crate::coordinator::{CoordinatorClient, JobDescriptor};
use crate::download::Downloader;
use crate::reporting;
use crate::ssrf::SsrfGuard;
use crate::state::{AgentShared, Mode, PollTier, claim_admitted, select_tier};
use crate::transcode::Transcoder;
use crate::upload::Uploader;
use crate::wakeup;
use crate::watchdog;
use crate::worker::{JobServices, WorkerCommand, WorkerEvent, run_worker_task};

/// ACTIVE-tier heartbeat cadence.
const ACTIVE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Ceiling for the unanswered-heartbeat counter.
const HEARTBEAT_MISS_CAP: u32 = 5;
/// Scratch files older than this are orphans from a previous run.
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(3600);

pub(crate) async fn run_agent(shared: Arc<AgentShared>, cfg: AgentConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    tokio::fs::create_dir_all(&cfg.temp_dir).await?;

    let telemetry = Arc::new(Telemetry::new(cfg.temp_dir.clone()));
    let client = Arc::new(CoordinatorClient::new(&cfg)?);
    let alerts = Arc::new(AlertChannel::new(&cfg)?);

    cleanup_orphans(&cfg.temp_dir).await;

    let health = telemetry.sample();
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let max_concurrent = config::compute_max_concurrent(
        cfg.max_concurrent_jobs,
        cpu_count,
        health.ram_available_gb,
    );
    tracing::info!(
        worker_id = %cfg.worker_id,
        cpu_count,
        ram_available_gb = health.ram_available_gb,
        max_concurrent,
        "agent initialized"
    );

    let guard = SsrfGuard::new(cdn_host(&cfg.cdn_base_url));
    let downloader = Arc::new(Downloader::new(
        guard,
        telemetry.clone(),
        cfg.max_url_download_bytes,
    )?);
    let transcoder = Arc::new(Transcoder::new(
        cfg.ffmpeg_path.clone(),
        cfg.thumbnail_scale.clone(),
        cfg.job_timeout,
    ));
    let uploader = Arc::new(Uploader::new(cfg.cdn_base_url.clone())?);

    alerts.startup().await;

    {
        let shared = shared.clone();
        let token = cfg.bearer_token.clone();
        let port = cfg.wakeup_port;
        let gear = cfg.active_gear_duration;
        tokio::spawn(async move {
            if let Err(err) = wakeup::serve_wakeup(shared, token, port, gear).await {
                tracing::error!(error = %err, "wakeup endpoint failed");
            }
        });
    }

    recover_interrupted_jobs(&cfg, &client, &alerts).await;

    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let services = JobServices {
        shared: shared.clone(),
        cfg: cfg.clone(),
        client: client.clone(),
        downloader: downloader.clone(),
        transcoder,
        uploader,
        alerts: alerts.clone(),
        download_permit: Arc::new(Semaphore::new(1)),
    };

    let mut worker_cmds = Vec::with_capacity(max_concurrent);
    let mut worker_join = JoinSet::new();
    for worker_idx in 0..max_concurrent {
        let (tx, rx) = mpsc::channel::<WorkerCommand>(1);
        worker_cmds.push(tx);
        worker_join.spawn(run_worker_task(
            worker_idx,
            rx,
            internal_tx.clone(),
            services.clone(),
        ));
    }

    tokio::spawn(reporting::run_stealth_heartbeat(
        shared.clone(),
        cfg.clone(),
        client.clone(),
    ));
    tokio::spawn(reporting::run_status_report(
        shared.clone(),
        cfg.clone(),
        telemetry.clone(),
        alerts.clone(),
    ));
    tokio::spawn(reporting::run_ping_loop(
        shared.clone(),
        cfg.clone(),
        telemetry.clone(),
        client.clone(),
    ));
    tokio::spawn(watchdog::run_ram_watchdog(
        shared.clone(),
        cfg.clone(),
        telemetry.clone(),
        client.clone(),
        alerts.clone(),
    ));
    tokio::spawn(command::run_command_loop(
        shared.clone(),
        cfg.clone(),
        telemetry.clone(),
        alerts.clone(),
    ));

    let runtime = AgentRuntime {
        shared,
        cfg,
        client,
        telemetry,
        downloader,
        worker_cmds,
        worker_busy: vec![false; max_concurrent],
        worker_join,
        internal_rx,
        pending: VecDeque::new(),
        max_concurrent,
        last_heartbeat_at: None,
    };
    runtime.run().await
}

struct AgentRuntime {
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    client: Arc<CoordinatorClient>,
    telemetry: Arc<Telemetry>,
    downloader: Arc<Downloader>,
    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    worker_busy: Vec<bool>,
    worker_join: JoinSet<()>,
    internal_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    pending: VecDeque<JobDescriptor>,
    max_concurrent: usize,
    last_heartbeat_at: Option<Instant>,
}

impl AgentRuntime {
    async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!("main loop started (stealth idle + active gear)");

        loop {
            if !self.shared.is_running() {
                break;
            }
            let now = Instant::now();

            // ACTIVE falls back to IDLE once the gear window lapses.
            {
                let mut state = self.shared.lock_state();
                if state.mode == Mode::Active
                    && state.active_gear_until.is_none_or(|until| now >= until)
                {
                    state.mode = Mode::Idle;
                }
            }

            let (mode, misses, idle_for, active_count, paused, since_claim) = {
                let state = self.shared.lock_state();
                (
                    state.mode,
                    state.heartbeat_misses,
                    now.duration_since(state.last_job_time),
                    state.active_jobs.len(),
                    state.paused,
                    state.last_claim_time.map(|at| now.duration_since(at)),
                )
            };

            if self.shared.is_ram_critical() && active_count == 0 && self.pending.is_empty() {
                tracing::info!("critical-RAM drain complete, stopping");
                self.shared.request_stop();
                break;
            }

            let tier = select_tier(mode, misses, idle_for, self.cfg.idle_to_deep_threshold);
            let wait = match tier {
                PollTier::Active => {
                    self.active_tick(now, active_count, paused, since_claim).await;
                    self.cfg.active_wait
                }
                PollTier::Idle => {
                    self.idle_heartbeat(now).await;
                    tracing::info!(
                        wait_secs = self.cfg.idle_wait.as_secs(),
                        "idle, next check scheduled"
                    );
                    self.cfg.idle_wait
                }
                PollTier::Deep1 => {
                    self.idle_heartbeat(now).await;
                    self.cfg.deep1_wait
                }
                PollTier::Deep2 => {
                    self.idle_heartbeat(now).await;
                    self.cfg.deep2_wait
                }
            };

            self.assign_jobs().await;
            self.shared
                .queue_depth
                .store(self.pending.len(), Ordering::SeqCst);

            // Cancellable sleep: wakeups and watchdog signals preempt any tier.
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shared.wakeup.notified() => {}
                ev = self.internal_rx.recv() => {
                    if let Some(WorkerEvent::Finished { worker_idx }) = ev {
                        if let Some(slot) = self.worker_busy.get_mut(worker_idx) {
                            *slot = false;
                        }
                    }
                }
            }
        }

        self.shutdown_workers().await;
        tracing::info!("agent stopped");
        Ok(())
    }

    async fn active_tick(
        &mut self,
        now: Instant,
        active_count: usize,
        paused: bool,
        since_claim: Option<Duration>,
    ) {
        self.shared.lock_state().heartbeat_misses = 0;

        if self
            .last_heartbeat_at
            .is_none_or(|at| now.duration_since(at) >= ACTIVE_HEARTBEAT_INTERVAL)
            && self.client.send_heartbeat(&self.shared, "ACTIVE").await.is_ok()
        {
            self.last_heartbeat_at = Some(now);
        }

        if !claim_admitted(
            self.shared.is_ram_critical(),
            paused,
            active_count,
            self.max_concurrent,
            since_claim,
            self.cfg.active_wait,
        ) {
            return;
        }

        self.client.mark_zombies().await;
        let claimed = self.client.claim_job().await;
        let admitted = match &claimed {
            Some(job) => self.ensure_disk_for(job).await,
            None => false,
        };

        // Claim bookkeeping: the timer tuple is updated in one critical
        // section so observers never see a claim without its timestamps.
        {
            let mut state = self.shared.lock_state();
            state.last_claim_time = Some(now);
            if claimed.is_some() && admitted {
                let accepted_at = Instant::now();
                state.last_job_time = accepted_at;
                state.active_gear_until = Some(accepted_at + self.cfg.active_gear_duration);
                state.mode = Mode::Active;
            } else if claimed.is_none()
                && state.active_gear_until.is_none_or(|until| Instant::now() >= until)
            {
                state.mode = Mode::Idle;
            }
        }

        if let Some(job) = claimed {
            if admitted {
                tracing::info!(job_id = job.id, quality = %job.quality, "job claimed");
                self.pending.push_back(job);
            } else {
                self.client
                    .fail_job(
                        job.id,
                        "insufficient disk space (need 2x the file size)",
                        "claim",
                        "",
                    )
                    .await;
            }
        }
    }

    async fn idle_heartbeat(&mut self, now: Instant) {
        let due = self
            .last_heartbeat_at
            .is_none_or(|at| now.duration_since(at) >= self.cfg.idle_heartbeat_interval);
        if !due {
            return;
        }

        match self.client.send_heartbeat(&self.shared, "ACTIVE").await {
            Ok(()) => {
                self.shared.lock_state().heartbeat_misses = 0;
            }
            Err(err) if err.is_no_response() => {
                let misses = {
                    let mut state = self.shared.lock_state();
                    state.heartbeat_misses = (state.heartbeat_misses + 1).min(HEARTBEAT_MISS_CAP);
                    state.heartbeat_misses
                };
                if misses == 2 {
                    tracing::info!("two unanswered heartbeats, extending sleep to six hours");
                }
                if misses >= 3 {
                    tracing::info!("heartbeat silence persists, hibernating on the 24h tier");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "heartbeat rejected");
            }
        }
        self.last_heartbeat_at = Some(now);
    }

    /// Disk guard before enqueueing a claimed job: size hint, else a HEAD
    /// probe of the source, else the URL cap, doubled against free space.
    async fn ensure_disk_for(&self, job: &JobDescriptor) -> bool {
        let mut size = job.file_size_input.unwrap_or(0);
        if size == 0 {
            if let Some(url) = job.source_url.as_deref().or(job.download_url.as_deref()) {
                size = self.downloader.probe_content_length(url).await.unwrap_or(0);
            }
        }
        if size == 0 {
            size = self.cfg.max_url_download_bytes;
        }
        match self.telemetry.disk_free_bytes() {
            Some(free) if free < size.saturating_mul(2) => {
                tracing::warn!(
                    free,
                    required = size.saturating_mul(2),
                    "insufficient disk for claimed job"
                );
                false
            }
            Some(_) => true,
            None => {
                tracing::warn!("disk guard could not stat the scratch mount, rejecting claim");
                false
            }
        }
    }

    async fn assign_jobs(&mut self) {
        for idx in 0..self.worker_cmds.len() {
            if self.worker_busy[idx] {
                continue;
            }
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.worker_busy[idx] = true;
            if self.worker_cmds[idx]
                .send(WorkerCommand::Job(job))
                .await
                .is_err()
            {
                tracing::error!(worker = idx + 1, "worker command channel closed");
                self.worker_busy[idx] = false;
            }
        }
    }

    async fn shutdown_workers(&mut self) {
        for tx in &self.worker_cmds {
            let _ = tx.send(WorkerCommand::Stop).await;
        }
        while let Some(res) = self.worker_join.join_next().await {
            if let Err(err) = res {
                tracing::error!(error = %err, "worker task join failed");
            }
        }
    }
}

fn cdn_host(cdn_base: &str) -> Option<String> {
    let absolute = if cdn_base.contains("://") {
        cdn_base.to_string()
    } else {
        format!("https://{cdn_base}")
    };
    reqwest::Url::parse(&absolute)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

async fn cleanup_orphans(temp_dir: &Path) {
    let root = temp_dir.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || remove_stale_media(&root))
        .await
        .unwrap_or(0);
    if removed > 0 {
        tracing::info!(removed, "orphan cleanup removed stale scratch files");
    }
}

/// Recursively remove `.part`/`.mov`/`.mp4` files older than an hour.
fn remove_stale_media(root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += remove_stale_media(&path);
            continue;
        }
        let stale_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "part" | "mov" | "mp4"))
            .unwrap_or(false);
        if !stale_ext {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age > ORPHAN_MAX_AGE)
            .unwrap_or(false);
        if old_enough {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "orphan cleanup failed")
                }
            }
        }
    }
    removed
}

async fn recover_interrupted_jobs(
    cfg: &Arc<AgentConfig>,
    client: &Arc<CoordinatorClient>,
    alerts: &Arc<AlertChannel>,
) {
    let ids = client.interrupted_job_ids().await;
    if ids.is_empty() {
        return;
    }
    tracing::info!(count = ids.len(), "interrupted jobs found");
    alerts
        .send(&format!(
            "⚠️ <b>INTERRUPTED JOBS</b>: {} job(s) found. Retry via dashboard or set \
             AUTO_RESUME_INTERRUPTED=1 to auto-resume on next start.",
            ids.len()
        ))
        .await;
    if cfg.auto_resume_interrupted {
        if let Some(retried) = client.retry_interrupted(&ids).await {
            if retried > 0 {
                tracing::info!(retried, "auto-resumed interrupted jobs");
                alerts
                    .send(&format!("✅ Auto-resumed {retried} interrupted job(s)."))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};
    use std::time::SystemTime;

    fn age_file(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).expect("open");
        let stamp = SystemTime::now() - age;
        file.set_times(FileTimes::new().set_modified(stamp)).expect("set mtime");
    }

    #[test]
    fn orphan_cleanup_honors_age_and_extension() {
        let root = tempfile::tempdir().expect("tempdir");
        let nested = root.path().join("bk-9-old");
        fs::create_dir(&nested).expect("mkdir");

        let stale_part = nested.join("input.mp4.part");
        let stale_mp4 = root.path().join("leftover.mp4");
        let fresh_mp4 = root.path().join("fresh.mp4");
        let stale_txt = root.path().join("notes.txt");
        for path in [&stale_part, &stale_mp4, &fresh_mp4, &stale_txt] {
            fs::write(path, b"x").expect("write");
        }
        age_file(&stale_part, Duration::from_secs(7200));
        age_file(&stale_mp4, Duration::from_secs(7200));
        age_file(&stale_txt, Duration::from_secs(7200));

        assert_eq!(remove_stale_media(root.path()), 2);
        assert!(!stale_part.exists());
        assert!(!stale_mp4.exists());
        assert!(fresh_mp4.exists());
        assert!(stale_txt.exists());
    }

    #[test]
    fn cdn_host_extraction() {
        assert_eq!(cdn_host("https://cdn.example.tr"), Some("cdn.example.tr".into()));
        assert_eq!(cdn_host("cdn.example.tr"), Some("cdn.example.tr".into()));
        assert_eq!(cdn_host("http://cdn.example.tr/base/"), Some("cdn.example.tr".into()));
    }
}
