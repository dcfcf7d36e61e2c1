//! RAM watchdog. Warns above the soft threshold, and above the critical
//! threshold latches the shutdown flag, terminates every registered
//! transcoder subprocess and hands the affected jobs back to the coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bk_agent_core::{AgentConfig, Telemetry};

use crate::alerts::AlertChannel;
use crate::coordinator::CoordinatorClient;
use crate::state::AgentShared;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
const WARNING_COOLDOWN: Duration = Duration::from_secs(300);
#[cfg(unix)]
const TERM_DEADLINE: Duration = Duration::from_secs(5);

pub(crate) async fn run_ram_watchdog(
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    telemetry: Arc<Telemetry>,
    client: Arc<CoordinatorClient>,
    alerts: Arc<AlertChannel>,
) {
    let mut last_warning: Option<Instant> = None;

    while shared.is_running() && !shared.is_ram_critical() {
        tokio::time::sleep(SAMPLE_INTERVAL).await;
        if !shared.is_running() {
            break;
        }
        let used = telemetry.sample().ram_used_gb;

        if used >= cfg.ram_critical_gb {
            let msg = "🔺 RAM CRITICAL — graceful shutdown (finish queued work, then stop)";
            tracing::error!(
                ram_used_gb = used,
                threshold = cfg.ram_critical_gb,
                "critical RAM threshold crossed"
            );
            shared.latch_ram_critical();
            client.system_alert("critical", msg).await;
            alerts.send(msg).await;
            interrupt_active_jobs(&shared, &client, "ram_critical").await;
            shared.wakeup.notify_one();
            return;
        }

        if used > cfg.ram_warning_gb
            && last_warning.is_none_or(|at| at.elapsed() > WARNING_COOLDOWN)
        {
            let msg = "⚠️ SYSTEM ANOMALY";
            tracing::warn!(
                ram_used_gb = used,
                threshold = cfg.ram_warning_gb,
                "RAM above warning threshold"
            );
            client.system_alert("warning", msg).await;
            alerts.send(msg).await;
            last_warning = Some(Instant::now());
        }
    }
}

/// Graceful-stop helper: snapshot the registries under the lock, kill the
/// transcoders first (releasing RAM before any network round-trips), then
/// post `jobs/interrupt` per job so the coordinator reschedules them. Each
/// job is marked in the interrupted set before its pipeline can observe the
/// failure, guaranteeing a single terminal call.
pub(crate) async fn interrupt_active_jobs(
    shared: &Arc<AgentShared>,
    client: &Arc<CoordinatorClient>,
    stage: &str,
) {
    let (job_ids, procs): (Vec<i64>, Vec<(i64, u32)>) = {
        let state = shared.lock_state();
        (
            state.active_jobs.keys().copied().collect(),
            state.active_procs.iter().map(|(id, pid)| (*id, *pid)).collect(),
        )
    };

    for job_id in &job_ids {
        shared.mark_interrupted(*job_id);
    }

    for (job_id, pid) in procs {
        tracing::info!(job_id, pid, "terminating transcoder subprocess");
        terminate_pid(pid).await;
    }

    for job_id in job_ids {
        client.interrupt_job(job_id, stage).await;
    }
}

/// Soft-terminate with a deadline, then hard-kill.
#[cfg(unix)]
async fn terminate_pid(pid: u32) {
    let pid = pid as i32;
    // SAFETY: plain signal delivery to a pid we spawned; no memory involved.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return; // already gone
    }

    let deadline = Instant::now() + TERM_DEADLINE;
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if !alive {
            return;
        }
    }
    tracing::info!(pid, "soft terminate deadline passed, sending SIGKILL");
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_pid(pid: u32) {
    tracing::warn!(pid, "subprocess termination not supported on this platform");
}
