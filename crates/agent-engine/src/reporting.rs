//! Background reporting loops: stealth heartbeat, routine status report and
//! ping telemetry. All exit at their next tick once the agent stops running.

use std::sync::Arc;

use serde_json::json;

use bk_agent_core::{AgentConfig, Telemetry};

use crate::alerts::AlertChannel;
use crate::coordinator::CoordinatorClient;
use crate::state::AgentShared;

/// Heartbeat on a fixed period, independent of the polling tiers. Silent on
/// success; a failure is only logged (tier escalation is the main loop's job).
pub(crate) async fn run_stealth_heartbeat(
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    client: Arc<CoordinatorClient>,
) {
    while shared.is_running() {
        tokio::time::sleep(cfg.stealth_heartbeat_interval).await;
        if !shared.is_running() {
            break;
        }
        if let Err(err) = client.send_heartbeat(&shared, "ACTIVE").await {
            tracing::error!(error = %err, "stealth heartbeat failed");
        }
    }
}

/// Routine node-stability report to the chat channel.
pub(crate) async fn run_status_report(
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    telemetry: Arc<Telemetry>,
    alerts: Arc<AlertChannel>,
) {
    while shared.is_running() {
        tokio::time::sleep(cfg.status_interval).await;
        if !shared.is_running() {
            break;
        }
        let health = telemetry.sample();
        let text = format!(
            "💠 <b>ROUTINE CHECK: NODE STABILITY</b> | CPU: %{:.0} | RAM: {:.1}/{:.1} GB | \
             DISK FREE: {:.1} GB | UPTIME: {:.1}h | STATUS: OPTIMAL",
            health.cpu_percent,
            health.ram_used_gb,
            health.ram_total_gb,
            health.disk_free_gb,
            shared.uptime_hours(),
        );
        alerts.send(&text).await;
    }
}

/// Compact telemetry ping, authenticated by the shared secret. Disabled when
/// no secret is configured.
pub(crate) async fn run_ping_loop(
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    telemetry: Arc<Telemetry>,
    client: Arc<CoordinatorClient>,
) {
    let Some(secret) = cfg.samaritan_secret.clone() else {
        tracing::debug!("ping loop disabled (no shared secret)");
        return;
    };
    while shared.is_running() {
        tokio::time::sleep(cfg.ping_interval).await;
        if !shared.is_running() {
            break;
        }
        let health = telemetry.sample();
        let jobs = shared.lock_state().active_jobs.len();
        let payload = json!({
            "cpu": (health.cpu_percent * 10.0).round() / 10.0,
            "ram": (health.ram_used_gb * 100.0).round() / 100.0,
            "uptime_hours": (shared.uptime_hours() * 100.0).round() / 100.0,
            "jobs": jobs,
            "node": "Primary Core",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        client.samaritan_ping(&secret, payload).await;
    }
}
