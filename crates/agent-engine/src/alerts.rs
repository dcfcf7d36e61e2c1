//! Out-of-band alerting: primary chat channel with a shadow webhook that
//! receives the same message (HTML stripped) when the chat API is unreachable.

use std::time::Duration;

use serde_json::json;

use bk_agent_core::AgentConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const PHOTO_TIMEOUT: Duration = Duration::from_secs(15);
const FALLBACK_MAX_CHARS: usize = 2000;

enum ChatDelivery {
    Delivered,
    /// Connection error, timeout or 5xx: the message may not have arrived.
    Unreachable,
    /// The chat API answered with a client error; retrying elsewhere is moot.
    Rejected,
    Unconfigured,
}

pub(crate) struct AlertChannel {
    http: reqwest::Client,
    token: Option<String>,
    chat_id: Option<String>,
    fallback_url: Option<String>,
    cdn_base: String,
}

impl AlertChannel {
    pub(crate) fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            token: cfg.telegram_token.clone(),
            chat_id: cfg.telegram_chat_id.clone(),
            fallback_url: cfg.fallback_webhook_url.clone(),
            cdn_base: cfg.cdn_base_url.clone(),
        })
    }

    /// Deliver `text` (HTML formatting) through the chat channel, falling back
    /// to the shadow webhook when the chat API cannot be reached. Returns
    /// whether at least one channel accepted the message.
    pub(crate) async fn send(&self, text: &str) -> bool {
        match self.send_chat(text).await {
            ChatDelivery::Delivered => true,
            ChatDelivery::Rejected => false,
            ChatDelivery::Unreachable | ChatDelivery::Unconfigured => self.send_fallback(text).await,
        }
    }

    async fn send_chat(&self, text: &str) -> ChatDelivery {
        let (Some(token), Some(chat_id)) = (self.token.as_deref(), self.chat_id.as_deref()) else {
            return ChatDelivery::Unconfigured;
        };
        let res = self
            .http
            .post(format!("https://api.telegram.org/bot{token}/sendMessage"))
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "chat_id": chat_id, "text": text, "parse_mode": "HTML" }))
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => ChatDelivery::Delivered,
            Ok(res) if res.status().is_server_error() => {
                tracing::warn!(status = %res.status(), "chat send failed, using shadow channel");
                ChatDelivery::Unreachable
            }
            Ok(res) => {
                tracing::warn!(status = %res.status(), "chat send rejected");
                ChatDelivery::Rejected
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat send failed, using shadow channel");
                ChatDelivery::Unreachable
            }
        }
    }

    async fn send_fallback(&self, text: &str) -> bool {
        let Some(url) = self.fallback_url.as_deref() else {
            return false;
        };
        let plain: String = strip_html(text).chars().take(FALLBACK_MAX_CHARS).collect();
        let res = self
            .http
            .post(url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "content": plain }))
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => {
                tracing::info!("shadow channel delivered (fallback webhook)");
                true
            }
            Ok(res) => {
                tracing::warn!(status = %res.status(), "fallback webhook rejected alert");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "fallback webhook failed");
                false
            }
        }
    }

    /// One-shot boot announcement.
    pub(crate) async fn startup(&self) {
        if !self.send("🟢 SYSTEM ONLINE | NODE: Primary Core").await {
            tracing::debug!("startup alert skipped (no chat configuration)");
        }
    }

    /// Post-completion preview: thumbnail photo with a caption, falling back
    /// to a plain message. Fire-and-forget.
    pub(crate) async fn asset_preview(
        &self,
        video_name: &str,
        duration: i64,
        thumbnail_key: Option<&str>,
    ) {
        let caption = format!(
            "> 🎬 <b>ASSET ACQUIRED</b>\n\
             [ > ] <b>FILE:</b> {video_name}\n\
             [ > ] <b>DURATION:</b> {duration}s\n\
             > <b>STATUS:</b> READY FOR DEPLOYMENT."
        );
        let (Some(token), Some(chat_id)) = (self.token.as_deref(), self.chat_id.as_deref()) else {
            return;
        };
        let Some(key) = thumbnail_key else {
            self.send(&caption).await;
            return;
        };

        let photo_url = crate::upload::public_url(&self.cdn_base, key);
        let res = self
            .http
            .post(format!("https://api.telegram.org/bot{token}/sendPhoto"))
            .timeout(PHOTO_TIMEOUT)
            .json(&json!({
                "chat_id": chat_id,
                "photo": photo_url,
                "caption": caption,
                "parse_mode": "HTML",
            }))
            .send()
            .await;
        let delivered = matches!(&res, Ok(res) if res.status().is_success());
        if !delivered {
            tracing::warn!("asset preview photo failed, sending plain message");
            self.send(&caption).await;
        }
    }
}

/// Drop `<...>` tags so chat-formatted text reads cleanly on plain webhooks.
pub(crate) fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_stripping() {
        assert_eq!(strip_html("<b>BOLD</b> plain"), "BOLD plain");
        assert_eq!(strip_html("no tags"), "no tags");
        assert_eq!(strip_html("a <b>b</b> <i>c</i>"), "a b c");
        assert_eq!(strip_html("dangling <b"), "dangling ");
    }
}
