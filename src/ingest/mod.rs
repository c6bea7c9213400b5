//! Real-time ingestion (4.H): consumes `StreamEvent`s from the venue stream
//! client, resolves them to outcomes, persists/caches/broadcasts, and feeds
//! the anomaly detector.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::alert;
use crate::cache::Cache;
use crate::config::ingest::{PERSIST_CHANGE_THRESHOLD, PERSIST_MAX_AGE_SECS, TRADE_SERIES_MAX_AGE_MS, TRADE_SERIES_MAX_ITEMS};
use crate::db::store::Store;
use crate::detect::anomaly;
use crate::market_index::TokenIndex;
use crate::rolling::RollingStore;
use crate::types::{OrderbookPayload, PriceEvent, PriceHistoryRow, PriceUpdate, StreamEvent, TradeEvent, TradePayload};

pub struct Ingestion {
    store: Store,
    cache: Cache,
    rolling: RollingStore,
    token_index: TokenIndex,
    broadcast_tx: broadcast::Sender<PriceUpdate>,
    last_persisted: DashMap<String, (f64, i64)>,
    active_markets: DashSet<String>,
}

impl Ingestion {
    pub fn new(
        store: Store,
        cache: Cache,
        rolling: RollingStore,
        token_index: TokenIndex,
        broadcast_tx: broadcast::Sender<PriceUpdate>,
    ) -> Self {
        Self {
            store,
            cache,
            rolling,
            token_index,
            broadcast_tx,
            last_persisted: DashMap::new(),
            active_markets: DashSet::new(),
        }
    }

    pub fn active_market_count(&self) -> usize {
        self.active_markets.len()
    }

    /// Drains the channel fed by the stream client's wildcard handler. Order
    /// per `assetId` is preserved because this loop is single-threaded over
    /// the shared channel; per-outcome state lives in `DashMap`s keyed by
    /// outcome id, not asset id, so concurrent outcomes never contend.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<StreamEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Price(p) => self.handle_price(p).await,
                StreamEvent::Trade(t) => self.handle_trade(t).await,
            }
        }
    }

    async fn resolve_outcome(&self, token_id: &str) -> Option<(String, String)> {
        if let Some(hit) = self.token_index.get(token_id) {
            return Some(hit);
        }
        // Startup race with the first sync cycle: the index may not be
        // seeded yet. Fall back to the store and backfill the index on hit.
        let hit = self.store.outcome_by_token(token_id).await?;
        self.token_index.insert(token_id.to_string(), hit.0.clone(), hit.1.clone());
        Some(hit)
    }

    async fn handle_price(&self, event: PriceEvent) {
        // Step 1: validate.
        if !(0.0..=1.0).contains(&event.bid) || !(0.0..=1.0).contains(&event.ask) {
            return;
        }

        // Step 3: resolve outcome.
        let Some((market_id, outcome_id)) = self.resolve_outcome(&event.asset_id).await else {
            debug!(asset_id = %event.asset_id, "price event for unknown outcome, dropped");
            return;
        };

        // Step 2: compute mid/implied probability.
        let row = PriceHistoryRow::new(event.bid, event.ask, event.ts_ms);

        // Step 4: scalar cache writes.
        self.cache
            .setex(&format!("market:{market_id}:price:{}", event.asset_id), &row.mid.to_string(), 3600)
            .await;
        self.cache.setex(&format!("token:{}:price", event.asset_id), &row.mid.to_string(), 3600).await;
        self.cache.h_set(&format!("market:{market_id}:prices"), &outcome_id, &row.mid.to_string()).await;
        self.cache.h_expire(&format!("market:{market_id}:prices"), 3600).await;

        // Step 5: throttled persistence.
        self.maybe_persist(&market_id, &outcome_id, &row).await;

        // Step 6: active markets.
        self.active_markets.insert(market_id.clone());

        // Step 7: invalidate read-cache.
        self.cache.del_pattern(&format!("read:market:{market_id}:*")).await;

        // Step 8: broadcast.
        let _ = self.broadcast_tx.send(PriceUpdate {
            market_id: market_id.clone(),
            outcome_id: outcome_id.clone(),
            bid: row.bid,
            ask: row.ask,
            mid: row.mid,
            implied_probability: row.implied_probability,
            ts_ms: event.ts_ms,
        });

        // Step 9: anomaly detection.
        self.detect_price_anomalies(&market_id, &outcome_id, &event).await;

        if let (Some(bid_size), Some(ask_size)) = (event.bid_size, event.ask_size) {
            self.handle_orderbook(&market_id, &outcome_id, &event, bid_size, ask_size).await;
        }
    }

    async fn maybe_persist(&self, market_id: &str, outcome_id: &str, row: &PriceHistoryRow) {
        let should_persist = match self.last_persisted.get(outcome_id) {
            Some(entry) => {
                let (last_mid, last_ts) = *entry;
                let change = if last_mid == 0.0 {
                    f64::INFINITY
                } else {
                    ((row.mid - last_mid) / last_mid).abs()
                };
                change > PERSIST_CHANGE_THRESHOLD || (row.timestamp_ms - last_ts) > PERSIST_MAX_AGE_SECS * 1000
            }
            None => true,
        };

        if !should_persist {
            return;
        }

        if let Err(e) = self.store.insert_price_history(market_id, outcome_id, row).await {
            warn!("price history write failed, dropping: {e}");
            return;
        }
        self.last_persisted.insert(outcome_id.to_string(), (row.mid, row.timestamp_ms));
    }

    async fn detect_price_anomalies(&self, market_id: &str, outcome_id: &str, event: &PriceEvent) {
        let mid = (event.bid + event.ask) / 2.0;
        let velocity = anomaly::price_velocity(&self.cache, market_id, outcome_id, mid, event.ts_ms).await;

        let Some(velocity_alert) = velocity else {
            return;
        };
        alert::enqueue(&self.cache, &velocity_alert).await;

        let current_minute_usdc = self.current_minute_volume(&event.asset_id, event.ts_ms).await;
        let volume_alert = anomaly::volume_acceleration(&self.rolling, &event.asset_id, current_minute_usdc, event.ts_ms).await;

        if let Some(volume_alert) = &volume_alert {
            alert::enqueue(&self.cache, volume_alert).await;
            let combined = anomaly::insider_move(&velocity_alert, volume_alert, market_id, outcome_id, event.ts_ms);
            alert::enqueue(&self.cache, &combined).await;
        }
    }

    async fn current_minute_volume(&self, token_id: &str, now_ms: i64) -> f64 {
        let bucket_start = (now_ms / 60_000) * 60_000;
        let trades: Vec<(i64, TradePayload)> = self
            .rolling
            .range_by_time(&format!("trades:{token_id}"), bucket_start, now_ms)
            .await;
        trades.iter().map(|(_, t)| t.size_usdc).sum()
    }

    async fn handle_orderbook(&self, market_id: &str, outcome_id: &str, event: &PriceEvent, bid_size: f64, ask_size: f64) {
        let spread = event.ask - event.bid;
        let depth = bid_size + ask_size;

        let payload = OrderbookPayload {
            spread,
            depth,
            bid: event.bid,
            ask: event.ask,
        };
        self.rolling
            .add(
                &format!("orderbook:{}", event.asset_id),
                event.ts_ms,
                &payload,
                TRADE_SERIES_MAX_AGE_MS,
                TRADE_SERIES_MAX_ITEMS,
                event.ts_ms,
            )
            .await;

        if let Some(alert) = anomaly::liquidity_vacuum(&self.cache, market_id, outcome_id, spread, depth, event.ts_ms).await {
            alert::enqueue(&self.cache, &alert).await;
        }
    }

    async fn handle_trade(&self, event: TradeEvent) {
        let Some((market_id, outcome_id)) = self.resolve_outcome(&event.asset_id).await else {
            debug!(asset_id = %event.asset_id, "trade event for unknown outcome, dropped");
            return;
        };

        let usdc = event.price * event.size;
        let payload = TradePayload {
            size: event.size,
            size_usdc: usdc,
            price: event.price,
        };

        self.rolling
            .add(
                &format!("trades:{}", event.asset_id),
                event.ts_ms,
                &payload,
                TRADE_SERIES_MAX_AGE_MS,
                TRADE_SERIES_MAX_ITEMS,
                event.ts_ms,
            )
            .await;

        if let Some(alert) = anomaly::whale_trade(&market_id, &outcome_id, usdc, event.ts_ms) {
            alert::enqueue(&self.cache, &alert).await;
        }

        if let Some(alert) = anomaly::fat_finger(&self.cache, &market_id, &outcome_id, event.price, event.ts_ms).await {
            alert::enqueue(&self.cache, &alert).await;
        }
    }
}

