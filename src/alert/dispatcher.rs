//! Alert dispatcher (4.L): a cooperative loop with two independent timers
//! (process 2s, cleanup 5m) and an IDLE/PROCESSING/STOPPED state machine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, warn};

use crate::alert::channels::{ChannelSet, FormattedAlert};
use crate::alert::throttle;
use crate::cache::Cache;
use crate::config::dispatcher::{CLEANUP_AGE_SECS, CLEANUP_SCAN_LIMIT, CLEANUP_TICK_SECS, MAX_AGE_SECS, PROCESS_TICK_SECS, STARTUP_SCAN_LIMIT};
use crate::config::Config;
use crate::db::store::Store;
use crate::types::{Alert, AlertPayload};
use crate::venue::rest::RestClient;

const PENDING_KEY: &str = "alerts:pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    Stopped = 0,
    Idle = 1,
    Processing = 2,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DispatcherState::Idle,
            2 => DispatcherState::Processing,
            _ => DispatcherState::Stopped,
        }
    }
}

pub struct Dispatcher {
    cache: Cache,
    store: Store,
    rest: RestClient,
    channels: ChannelSet,
    cfg: Config,
    state: Arc<AtomicU8>,
}

impl Dispatcher {
    pub fn new(cache: Cache, store: Store, rest: RestClient, channels: ChannelSet, cfg: Config) -> Self {
        Self {
            cache,
            store,
            rest,
            channels,
            cfg,
            state: Arc::new(AtomicU8::new(DispatcherState::Stopped as u8)),
        }
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Idempotent from `STOPPED`: spawns both ticker loops once, transitions
    /// to `IDLE`. Calling `start()` while already running is a no-op.
    pub async fn start(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(
                DispatcherState::Stopped as u8,
                DispatcherState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("dispatcher already running, start() is a no-op");
            return;
        }

        self.startup_scan().await;

        let process_self = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(PROCESS_TICK_SECS));
            loop {
                tick.tick().await;
                if process_self.state() == DispatcherState::Stopped {
                    break;
                }
                process_self.process_tick().await;
            }
        });

        let cleanup_self = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(CLEANUP_TICK_SECS));
            loop {
                tick.tick().await;
                if cleanup_self.state() == DispatcherState::Stopped {
                    break;
                }
                cleanup_self.cleanup_tick().await;
            }
        });
    }

    /// Cancels both timers. In-flight work (the alert currently being
    /// delivered) is allowed to finish; no new tick starts after this call.
    pub fn stop(&self) {
        self.state.store(DispatcherState::Stopped as u8, Ordering::SeqCst);
    }

    /// Trims up to 1000 stale entries off the tail, discarding anything
    /// malformed or older than `MAX_AGE` (10m), so a redeploy doesn't
    /// immediately replay a backlog of stale alerts. Peeks with `l_index`
    /// before popping so the first fresh entry found is left exactly where
    /// it was — the list stays newest-first throughout (no pop/push-back,
    /// which would promote a surviving old entry ahead of anything enqueued
    /// since).
    async fn startup_scan(&self) {
        let now_ms = now_ms();
        for _ in 0..STARTUP_SCAN_LIMIT {
            let Some(raw) = self.cache.l_index(PENDING_KEY, -1).await else {
                break;
            };
            let stale = match serde_json::from_str::<Alert>(&raw) {
                Ok(alert) => now_ms - alert.timestamp_ms > MAX_AGE_SECS * 1000,
                Err(_) => true,
            };
            if !stale {
                break;
            }
            self.cache.l_pop_tail(PENDING_KEY).await;
        }
    }

    async fn process_tick(&self) {
        self.state.store(DispatcherState::Processing as u8, Ordering::SeqCst);
        self.process_one().await;
        if self.state() == DispatcherState::Processing {
            self.state.store(DispatcherState::Idle as u8, Ordering::SeqCst);
        }
    }

    async fn process_one(&self) {
        let Some(raw) = self.cache.l_pop_head(PENDING_KEY).await else {
            return;
        };

        let alert: Alert = match serde_json::from_str(&raw) {
            Ok(a) => a,
            Err(e) => {
                warn!("malformed alert discarded: {e}");
                return;
            }
        };

        let now = now_ms();
        if now - alert.timestamp_ms > MAX_AGE_SECS * 1000 {
            debug!(market_id = %alert.market_id, "alert too old, skipping");
            return;
        }

        if throttle::should_throttle(&self.cache, &self.cfg, &alert).await {
            debug!(market_id = %alert.market_id, kind = alert.kind(), "alert throttled");
            return;
        }

        let message = self.format_message(&alert).await;
        let formatted = FormattedAlert { message, alert: alert.clone() };

        let results = self.channels.fan_out(&formatted).await;
        for (name, delivered) in &results {
            if !delivered {
                warn!(channel = name, market_id = %alert.market_id, "channel delivery failed");
            }
        }

        throttle::record_delivery(&self.cache, &self.cfg, &alert, now).await;
    }

    /// Trims tail entries while malformed or older than `CLEANUP_AGE` (30m),
    /// bounded to 100 scans. Same peek-then-pop pattern as `startup_scan` so
    /// a surviving entry is never reordered to the head.
    async fn cleanup_tick(&self) {
        for _ in 0..CLEANUP_SCAN_LIMIT {
            let Some(raw) = self.cache.l_index(PENDING_KEY, -1).await else {
                break;
            };
            let stale = match serde_json::from_str::<Alert>(&raw) {
                Ok(alert) => now_ms() - alert.timestamp_ms > CLEANUP_AGE_SECS * 1000,
                Err(_) => true,
            };
            if !stale {
                break;
            }
            self.cache.l_pop_tail(PENDING_KEY).await;
        }
    }

    async fn format_message(&self, alert: &Alert) -> String {
        let brief = self.store.market_brief(&alert.market_id).await;
        let question = brief.as_ref().map(|(q, _, _)| q.clone()).unwrap_or_else(|| alert.market_id.clone());
        let slug = self.resolve_event_slug(&alert.market_id, brief.as_ref().map(|(_, _, s)| s.as_str())).await;
        let outcome = alert.outcome_name.clone();

        let detail = match &alert.payload {
            AlertPayload::PriceVelocity { last_price, current_price, .. } => {
                format!("price moved {last_price:.3} -> {current_price:.3}")
            }
            AlertPayload::InsiderMove { last_price, current_price, volume_z, .. } => {
                format!("price {last_price:.3} -> {current_price:.3} with volume z={volume_z:.2}")
            }
            AlertPayload::VolumeAcceleration { current_volume, z, .. } => {
                format!("volume ${current_volume:.0} (z={z:.2})")
            }
            AlertPayload::FatFinger { percentage_change, reversion_change } => {
                format!("move {:.1}% reverted {:.1}%", percentage_change * 100.0, reversion_change * 100.0)
            }
            AlertPayload::LiquidityVacuum { spread, depth_drop_pct } => match (spread, depth_drop_pct) {
                (Some(s), _) => format!("spread widened to {:.3}", s),
                (_, Some(d)) => format!("depth dropped {:.0}%", d * 100.0),
                _ => "liquidity thinned".to_string(),
            },
            AlertPayload::WhaleTrade { trade_size } => format!("trade of ${trade_size:.0}"),
            AlertPayload::NewMarket { question } => format!("new market: {question}"),
            AlertPayload::NewOutcome { outcome_name } => format!("new outcome: {outcome_name}"),
        };

        match (slug, outcome) {
            (Some(slug), Some(o)) => format!("[{question} / {o}] ({slug}): {detail}"),
            (Some(slug), None) => format!("[{question}] ({slug}): {detail}"),
            (None, Some(o)) => format!("[{question} / {o}]: {detail}"),
            (None, None) => format!("[{question}]: {detail}"),
        }
    }

    /// `event_slug:<id>` cache (24h TTL), falling back to a DB lookup by
    /// `questionId`, falling back to the market's own slug. Slug discovery
    /// gets its own 3s timeout rather than the REST client's general 10s
    /// market-fetch timeout (§5 Cancellation & timeouts).
    async fn resolve_event_slug(&self, market_id: &str, own_slug: Option<&str>) -> Option<String> {
        let cache_key = format!("event_slug:{market_id}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Some(cached);
        }

        let fetched = tokio::time::timeout(Duration::from_secs(3), self.rest.fetch_market(market_id))
            .await
            .ok()
            .flatten();
        let via_question_id = match fetched.and_then(|m| m.question_id) {
            Some(qid) => self.store.event_slug_by_question_id(&qid).await,
            None => None,
        };
        let resolved = via_question_id.or_else(|| own_slug.map(|s| s.to_string()));

        if let Some(slug) = &resolved {
            self.cache.setex(&cache_key, slug, 24 * 3600).await;
        }
        resolved
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_round_trip_through_u8() {
        assert_eq!(DispatcherState::from_u8(0), DispatcherState::Stopped);
        assert_eq!(DispatcherState::from_u8(1), DispatcherState::Idle);
        assert_eq!(DispatcherState::from_u8(2), DispatcherState::Processing);
    }
}
