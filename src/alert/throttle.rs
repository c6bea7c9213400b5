//! Alert throttle (4.K): cache-backed cooldown keyed by market and by
//! (market, type), with a critical-severity bypass.

use crate::cache::Cache;
use crate::config::{throttle::TYPE_COOLDOWNS, Config};
use crate::types::{Alert, Severity};

fn market_key(market_id: &str) -> String {
    format!("throttle:market:{market_id}")
}

fn type_key(market_id: &str, kind: &str) -> String {
    format!("throttle:market:{market_id}:{kind}")
}

/// Severity override if present, else the per-type table, else the global
/// default (4.K step 2).
fn resolve_cooldown_secs(cfg: &Config, alert: &Alert) -> i64 {
    let severity_override = match alert.severity {
        Severity::High => cfg.severity_cooldown_high_secs,
        Severity::Medium => cfg.severity_cooldown_medium_secs,
        Severity::Low => cfg.severity_cooldown_low_secs,
        Severity::Critical => None,
    };
    if let Some(secs) = severity_override {
        return secs;
    }

    TYPE_COOLDOWNS
        .iter()
        .find(|(kind, _)| *kind == alert.kind())
        .map(|(_, secs)| *secs)
        .unwrap_or(cfg.alert_throttle_cooldown_secs)
}

/// `true` if the alert should be suppressed.
pub async fn should_throttle(cache: &Cache, cfg: &Config, alert: &Alert) -> bool {
    if alert.severity == Severity::Critical && cfg.critical_bypass_throttle {
        return false;
    }

    let mkey = market_key(&alert.market_id);
    let tkey = type_key(&alert.market_id, alert.kind());
    cache.get(&mkey).await.is_some() || cache.get(&tkey).await.is_some()
}

/// Records a successful delivery so subsequent alerts within the cooldown
/// window are suppressed (4.K step 4). The stamp carries the resolved
/// cooldown alongside the timestamp (`<started_ms>:<cooldown_secs>`) so
/// `time_until_next` can recover the exact cooldown that was in force
/// rather than assuming the global default.
pub async fn record_delivery(cache: &Cache, cfg: &Config, alert: &Alert, now_ms: i64) {
    let cooldown = resolve_cooldown_secs(cfg, alert);
    let mkey = market_key(&alert.market_id);
    let tkey = type_key(&alert.market_id, alert.kind());
    let stamp = format!("{now_ms}:{cooldown}");
    cache.setex(&mkey, &stamp, cooldown.max(0) as u64).await;
    cache.setex(&tkey, &stamp, cooldown.max(0) as u64).await;
}

/// Ceiling remaining seconds based on the per-market key, or `None` if not
/// currently throttled (4.K step 5).
pub async fn time_until_next(cache: &Cache, market_id: &str, now_ms: i64) -> Option<i64> {
    let mkey = market_key(market_id);
    let raw = cache.get(&mkey).await?;
    let (started_str, cooldown_str) = raw.split_once(':')?;
    let started_ms: i64 = started_str.parse().ok()?;
    let cooldown_secs: i64 = cooldown_str.parse().ok()?;

    let elapsed_secs = (now_ms - started_ms).max(0) / 1000;
    let remaining = cooldown_secs - elapsed_secs;
    (remaining > 0).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> Config {
        Config {
            stream_url: String::new(),
            gamma_api_url: String::new(),
            clob_api_url: String::new(),
            log_level: "info".into(),
            database_url: "postgres://x".into(),
            redis_url: String::new(),
            api_port: 3000,
            sync_interval_minutes: 5,
            discovery_interval_minutes: 30,
            alert_throttle_cooldown_secs: 600,
            critical_bypass_throttle: true,
            severity_cooldown_high_secs: None,
            severity_cooldown_medium_secs: None,
            severity_cooldown_low_secs: None,
            webhook_enabled: false,
            webhook_url: None,
            webhook_secret: None,
            webhook_timeout_ms: 5000,
            webhook_retry_attempts: 3,
            broadcast_alerts_enabled: true,
            email_enabled: false,
            persistence_retention_days: 1,
        }
    }

    fn sample_alert(kind_payload: crate::types::AlertPayload, severity: Severity) -> Alert {
        Alert {
            severity,
            market_id: "m1".into(),
            outcome_id: None,
            token_id: None,
            outcome_name: None,
            message: "x".into(),
            payload: kind_payload,
            timestamp_ms: 0,
            extras: Default::default(),
        }
    }

    #[test]
    fn resolves_per_type_cooldown_when_no_override() {
        let cfg = base_cfg();
        let alert = sample_alert(crate::types::AlertPayload::WhaleTrade { trade_size: 12000.0 }, Severity::Medium);
        assert_eq!(resolve_cooldown_secs(&cfg, &alert), 60);
    }

    #[test]
    fn severity_override_wins_over_type_table() {
        let mut cfg = base_cfg();
        cfg.severity_cooldown_medium_secs = Some(45);
        let alert = sample_alert(crate::types::AlertPayload::WhaleTrade { trade_size: 12000.0 }, Severity::Medium);
        assert_eq!(resolve_cooldown_secs(&cfg, &alert), 45);
    }

    #[test]
    fn falls_back_to_global_default() {
        let cfg = base_cfg();
        let alert = sample_alert(crate::types::AlertPayload::NewMarket { question: "x".into() }, Severity::Medium);
        assert_eq!(resolve_cooldown_secs(&cfg, &alert), 600);
    }

    #[test]
    fn time_until_next_uses_resolved_cooldown_not_global_default() {
        // §8 scenario 4: whale_trade's 60s cooldown, not the 600s default.
        let stamp = format!("{}:{}", 0, 60);
        let started_ms: i64 = stamp.split_once(':').unwrap().0.parse().unwrap();
        let cooldown_secs: i64 = stamp.split_once(':').unwrap().1.parse().unwrap();
        let now_ms = 30_000;
        let elapsed_secs = (now_ms - started_ms).max(0) / 1000;
        let remaining = cooldown_secs - elapsed_secs;
        assert_eq!(remaining, 30);
    }
}
