//! Remote command channel: long-polls the chat API update feed and executes
//! `/status`, `/pause` and `/resume` for the single authorized chat identity.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;

use bk_agent_core::{AgentConfig, SystemHealth, Telemetry};

use crate::alerts::AlertChannel;
use crate::state::AgentShared;

const LONG_POLL_SECS: u64 = 30;
/// A 409 means a webhook owns the bot's update feed; back off hard.
const WEBHOOK_CONFLICT_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    edited_message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

pub(crate) async fn run_command_loop(
    shared: Arc<AgentShared>,
    cfg: Arc<AgentConfig>,
    telemetry: Arc<Telemetry>,
    alerts: Arc<AlertChannel>,
) {
    let (Some(token), Some(allowed_chat)) =
        (cfg.telegram_token.as_deref(), cfg.telegram_chat_id.as_deref())
    else {
        tracing::debug!("command channel disabled (no chat configuration)");
        return;
    };
    let allowed_chat = allowed_chat.trim();
    let poll_interval = cfg.telegram_poll_interval.max(Duration::from_secs(2));

    let http = match reqwest::Client::builder().build() {
        Ok(http) => http,
        Err(err) => {
            tracing::error!(error = %err, "command channel disabled: http client");
            return;
        }
    };
    let base = format!("https://api.telegram.org/bot{token}");
    let mut offset: i64 = 0;

    while shared.is_running() {
        let res = http
            .get(format!("{base}/getUpdates"))
            .query(&[("offset", offset), ("timeout", LONG_POLL_SECS as i64)])
            .timeout(Duration::from_secs(LONG_POLL_SECS + 5))
            .send()
            .await;

        let res = match res {
            Ok(res) if res.status() == reqwest::StatusCode::CONFLICT => {
                tracing::warn!(
                    "chat API 409: a webhook owns this bot's update feed; remote pause/resume \
                     unavailable until the webhook is removed"
                );
                tokio::time::sleep(WEBHOOK_CONFLICT_BACKOFF).await;
                continue;
            }
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                tracing::debug!(status = %res.status(), "update feed poll rejected");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(err) => {
                tracing::debug!(error = %err, "update feed poll failed");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let data = match res.json::<UpdatesResponse>().await {
            Ok(data) if data.ok => data,
            _ => {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        for update in data.result {
            offset = offset.max(update.update_id + 1);
            let Some(msg) = update.message.or(update.edited_message) else {
                continue;
            };
            if msg.chat.id.to_string() != allowed_chat {
                continue;
            }
            let text = msg.text.unwrap_or_default().trim().to_ascii_lowercase();
            match text.as_str() {
                "/status" => {
                    let health = telemetry.sample();
                    let (active_ids, paused) = {
                        let state = shared.lock_state();
                        let mut ids: Vec<i64> = state.active_jobs.keys().copied().collect();
                        ids.sort_unstable();
                        (ids, state.paused)
                    };
                    let queue = shared.queue_depth.load(Ordering::SeqCst);
                    let report = status_text(
                        &cfg.worker_id,
                        &health,
                        &active_ids,
                        queue,
                        shared.uptime_hours(),
                        paused,
                    );
                    alerts.send(&report).await;
                }
                "/pause" => {
                    shared.lock_state().paused = true;
                    tracing::info!("pause command received");
                    alerts
                        .send("⏸ <b>PAUSE</b> — New claims disabled. Current work and queue will finish.")
                        .await;
                }
                "/resume" => {
                    shared.lock_state().paused = false;
                    tracing::info!("resume command received");
                    alerts.send("▶ <b>RESUME</b> — Accepting new jobs again.").await;
                }
                _ => {}
            }
        }
    }
    tracing::debug!("command channel stopped");
}

fn status_text(
    worker_id: &str,
    health: &SystemHealth,
    active_ids: &[i64],
    queue: usize,
    uptime_hours: f64,
    paused: bool,
) -> String {
    let mode = if paused { "PAUSED" } else { "ACTIVE" };
    let mut lines = vec![
        "🔎 <b>SAMARITAN STATUS</b>".to_string(),
        format!("[ > ] <b>NODE:</b> {worker_id}"),
        format!("[ > ] <b>CPU:</b> %{:.0}", health.cpu_percent),
        format!(
            "[ > ] <b>RAM:</b> {:.1} / {:.1} GB",
            health.ram_used_gb, health.ram_total_gb
        ),
        format!("[ > ] <b>DISK FREE:</b> {:.1} GB", health.disk_free_gb),
        format!("[ > ] <b>ACTIVE JOBS:</b> {}", active_ids.len()),
        format!("[ > ] <b>QUEUE:</b> {queue}"),
        format!("[ > ] <b>UPTIME:</b> {uptime_hours:.1}h"),
        format!("[ ! ] <b>MODE:</b> {mode}"),
    ];
    if !active_ids.is_empty() {
        let ids: Vec<String> = active_ids.iter().map(i64::to_string).collect();
        lines.push(format!("[ > ] <b>JOB IDs:</b> {}", ids.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_snapshot_format() {
        let health = SystemHealth {
            cpu_percent: 42.6,
            ram_total_gb: 32.0,
            ram_used_gb: 12.34,
            ram_available_gb: 19.66,
            disk_total_gb: 500.0,
            disk_used_gb: 100.0,
            disk_free_gb: 400.0,
        };
        let text = status_text("node-1", &health, &[5, 9], 3, 1.25, false);
        assert!(text.contains("<b>NODE:</b> node-1"));
        assert!(text.contains("<b>CPU:</b> %43"));
        assert!(text.contains("<b>RAM:</b> 12.3 / 32.0 GB"));
        assert!(text.contains("<b>ACTIVE JOBS:</b> 2"));
        assert!(text.contains("<b>QUEUE:</b> 3"));
        assert!(text.contains("<b>MODE:</b> ACTIVE"));
        assert!(text.contains("<b>JOB IDs:</b> 5, 9"));

        let paused = status_text("node-1", &health, &[], 0, 0.0, true);
        assert!(paused.contains("<b>MODE:</b> PAUSED"));
        assert!(!paused.contains("JOB IDs"));
    }
}
