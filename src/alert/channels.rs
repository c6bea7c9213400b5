//! Notification channels (4.M): a uniform `send` capability with three
//! implementations — webhook, broadcast, and a stub email seam.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::channels::{EMBED_HOST_SUFFIXES, WEBHOOK_BACKOFF_MS};
use crate::types::Alert;

#[derive(Debug, Clone, Serialize)]
pub struct FormattedAlert {
    pub message: String,
    pub alert: Alert,
}

/// The three implementations below share a `name/enabled/send` shape but are
/// dispatched by the alert dispatcher through a concrete enum rather than a
/// trait object — native `async fn` avoids needing `async_trait` for a seam
/// this narrow.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
    enabled: bool,
    retry_attempts: u32,
}

impl WebhookChannel {
    pub fn new(url: Option<String>, secret: Option<String>, enabled: bool, timeout_ms: u64, retry_attempts: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url,
            secret,
            enabled,
            retry_attempts,
        }
    }

    pub fn name(&self) -> &'static str {
        "webhook"
    }

    pub fn enabled(&self) -> bool {
        self.enabled && self.url.is_some()
    }

    fn is_embed_sink(&self, url: &str) -> bool {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .map(|host| EMBED_HOST_SUFFIXES.iter().any(|suffix| host.ends_with(suffix)))
            .unwrap_or(false)
    }

    fn payload(&self, url: &str, formatted: &FormattedAlert) -> serde_json::Value {
        if self.is_embed_sink(url) {
            serde_json::json!({
                "content": formatted.message,
                "embeds": [{
                    "title": formatted.alert.kind(),
                    "description": formatted.message,
                }],
            })
        } else {
            serde_json::json!({
                "alert": formatted.alert,
                "metrics": {},
            })
        }
    }

    pub async fn send(&self, formatted: &FormattedAlert) -> bool {
        let Some(url) = &self.url else { return false };
        let body = self.payload(url, formatted);

        for (attempt, delay_ms) in std::iter::once(0).chain(WEBHOOK_BACKOFF_MS.iter().copied()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if attempt as u32 > self.retry_attempts {
                break;
            }

            let mut req = self.client.post(url).json(&body);
            if let Some(secret) = &self.secret {
                req = req.header("X-Webhook-Secret", secret);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => warn!(status = %resp.status(), "webhook delivery rejected"),
                Err(e) => warn!("webhook delivery error: {e}"),
            }
        }
        false
    }
}

pub struct BroadcastChannel {
    tx: broadcast::Sender<FormattedAlert>,
    enabled: bool,
}

impl BroadcastChannel {
    pub fn new(tx: broadcast::Sender<FormattedAlert>, enabled: bool) -> Self {
        Self { tx, enabled }
    }

    pub fn name(&self) -> &'static str {
        "broadcast"
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn send(&self, formatted: &FormattedAlert) -> bool {
        // No subscribers is not a failure; the broadcaster's job is just to
        // hand off, not to guarantee a listener exists.
        self.tx.send(formatted.clone()).is_ok() || self.tx.receiver_count() == 0
    }
}

#[derive(Default)]
pub struct EmailChannel {
    enabled: bool,
}

impl EmailChannel {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn name(&self) -> &'static str {
        "email"
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Stub: no SMTP transport wired up; returns false unless the operator
    /// has explicitly enabled it, in which case it still fails closed until
    /// a transport is configured. The seam exists for a later integration.
    pub async fn send(&self, _formatted: &FormattedAlert) -> bool {
        false
    }
}

/// All enabled channels, fanned out to with bounded parallelism by the
/// dispatcher (4.L step 7). One failing channel never blocks another.
pub struct ChannelSet {
    pub webhook: WebhookChannel,
    pub broadcast: BroadcastChannel,
    pub email: EmailChannel,
}

impl ChannelSet {
    /// Sends to every enabled channel concurrently; returns per-channel
    /// `(name, delivered)` so the dispatcher can log without one channel's
    /// failure affecting another's result.
    pub async fn fan_out(&self, formatted: &FormattedAlert) -> Vec<(&'static str, bool)> {
        let webhook = async {
            if self.webhook.enabled() {
                Some((self.webhook.name(), self.webhook.send(formatted).await))
            } else {
                None
            }
        };
        let broadcast = async {
            if self.broadcast.enabled() {
                Some((self.broadcast.name(), self.broadcast.send(formatted).await))
            } else {
                None
            }
        };
        let email = async {
            if self.email.enabled() {
                Some((self.email.name(), self.email.send(formatted).await))
            } else {
                None
            }
        };

        let (w, b, e) = tokio::join!(webhook, broadcast, email);
        [w, b, e].into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_sink_detection() {
        let ch = WebhookChannel::new(None, None, true, 5000, 3);
        assert!(ch.is_embed_sink("https://discord.com/api/webhooks/x"));
        assert!(!ch.is_embed_sink("https://example.com/hook"));
    }

    #[tokio::test]
    async fn email_channel_always_fails_closed() {
        let ch = EmailChannel::new(true);
        let formatted = FormattedAlert {
            message: "x".into(),
            alert: Alert {
                severity: crate::types::Severity::Low,
                market_id: "m".into(),
                outcome_id: None,
                token_id: None,
                outcome_name: None,
                message: "x".into(),
                payload: crate::types::AlertPayload::WhaleTrade { trade_size: 1.0 },
                timestamp_ms: 0,
                extras: Default::default(),
            },
        };
        assert!(!ch.send(&formatted).await);
    }
}
