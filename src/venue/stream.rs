//! Venue stream client (4.F): single connection, documented state machine,
//! heartbeat, demultiplex, exponential-backoff reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{
    WS_BACKOFF_BASE_MS, WS_BACKOFF_CAP_MS, WS_MAX_RECONNECT_ATTEMPTS, WS_PING_INTERVAL_SECS,
    WS_SUBSCRIBE_CHUNK_SIZE,
};
use crate::error::Result;
use crate::types::{ControlMsg, PriceEvent, PriceEventKind, StreamEvent, TradeEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Subscribing = 3,
    Subscribed = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Subscribing,
            4 => ConnectionState::Subscribed,
            5 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

pub struct StreamClient {
    ws_url: String,
    control_rx: mpsc::Receiver<ControlMsg>,
    event_tx: mpsc::Sender<StreamEvent>,
    state: Arc<AtomicU8>,
}

impl StreamClient {
    pub fn new(
        ws_url: String,
        control_rx: mpsc::Receiver<ControlMsg>,
        event_tx: mpsc::Sender<StreamEvent>,
    ) -> (Self, Arc<AtomicU8>) {
        let state = Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8));
        (
            Self {
                ws_url,
                control_rx,
                event_tx,
                state: state.clone(),
            },
            state,
        )
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub async fn run(mut self) {
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut attempt = 0u32;

        loop {
            if attempt >= WS_MAX_RECONNECT_ATTEMPTS {
                warn!("reconnect budget exhausted ({attempt} attempts); idling for a Reconnect signal");
                self.set_state(ConnectionState::Closed);
                loop {
                    match self.control_rx.recv().await {
                        Some(ControlMsg::Reconnect) => {
                            attempt = 0;
                            break;
                        }
                        Some(ControlMsg::Subscribe(ids)) => {
                            subscribed.extend(ids);
                        }
                        Some(ControlMsg::Unsubscribe(ids)) => {
                            for id in ids {
                                subscribed.remove(&id);
                            }
                        }
                        None => return,
                    }
                }
            }

            self.set_state(ConnectionState::Connecting);
            info!(url = %self.ws_url, "stream connecting");
            match self.connect_once(&mut subscribed).await {
                Ok(()) => {
                    info!("stream closed cleanly");
                    attempt = 0;
                }
                Err(e) => {
                    error!("stream error: {e}");
                    attempt += 1;
                }
            }
            self.set_state(ConnectionState::Closed);

            let delay_ms = (WS_BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10))).min(WS_BACKOFF_CAP_MS);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn connect_once(&mut self, subscribed: &mut HashSet<String>) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();
        self.set_state(ConnectionState::Connected);

        if !subscribed.is_empty() {
            self.set_state(ConnectionState::Subscribing);
            let ids: Vec<String> = subscribed.iter().cloned().collect();
            send_subscribe(&mut write, &ids).await?;
            self.set_state(ConnectionState::Subscribed);
        }

        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("stream heartbeat");
                    write.send(Message::Text("PING".into())).await?;
                }

                ctrl = self.control_rx.recv() => {
                    match ctrl {
                        Some(ControlMsg::Subscribe(ids)) => {
                            let new_ids: Vec<String> = ids.into_iter().filter(|id| subscribed.insert(id.clone())).collect();
                            if !new_ids.is_empty() {
                                self.set_state(ConnectionState::Subscribing);
                                send_subscribe(&mut write, &new_ids).await?;
                                self.set_state(ConnectionState::Subscribed);
                            }
                        }
                        Some(ControlMsg::Unsubscribe(ids)) => {
                            for id in &ids {
                                subscribed.remove(id);
                            }
                            let _ = send_unsubscribe(&mut write, &ids).await;
                        }
                        Some(ControlMsg::Reconnect) => {
                            // Already connected; nothing to reset.
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("pong") || trimmed == "INVALID OPERATION" {
            return;
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if v.get("type").and_then(|t| t.as_str()) == Some("pong") {
                return;
            }
        }

        for event in demux_frame(trimmed, now_ms()) {
            if let Err(e) = self.event_tx.try_send(event) {
                warn!("ingestion channel full, dropping stream event: {e}");
            }
        }
    }
}

async fn send_subscribe<S>(write: &mut S, ids: &[String]) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for chunk in ids.chunks(WS_SUBSCRIBE_CHUNK_SIZE) {
        let msg = serde_json::json!({"type": "market", "assets_ids": chunk}).to_string();
        write.send(Message::Text(msg.into())).await?;
    }
    Ok(())
}

async fn send_unsubscribe<S>(write: &mut S, ids: &[String]) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let msg = serde_json::json!({"assets_ids": ids, "operation": "unsubscribe"}).to_string();
    write.send(Message::Text(msg.into())).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame demultiplexing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct PriceChangeEntry {
    asset_id: String,
    price: Option<String>,
    size: Option<String>,
    side: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event_type: Option<String>,
    asset_id: Option<String>,
    asks: Option<Vec<BookLevel>>,
    bids: Option<Vec<BookLevel>>,
    price_changes: Option<Vec<PriceChangeEntry>>,
    price: Option<String>,
    size: Option<String>,
    side: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
}

/// Parse a single WS text frame into zero or more canonical stream events.
/// Tolerates a bare object or an array of objects.
pub fn demux_frame(raw: &str, now_ms: i64) -> Vec<StreamEvent> {
    let envelopes: Vec<RawEnvelope> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        serde_json::from_str::<RawEnvelope>(raw).map(|e| vec![e]).unwrap_or_default()
    };

    let mut out = Vec::new();
    for env in envelopes {
        expand_envelope(env, now_ms, &mut out);
    }
    out
}

fn parse_f64(s: &Option<String>) -> Option<f64> {
    s.as_deref().and_then(|x| x.parse::<f64>().ok())
}

fn expand_envelope(env: RawEnvelope, now_ms: i64, out: &mut Vec<StreamEvent>) {
    match env.event_type.as_deref() {
        Some("book") => {
            let Some(asset_id) = env.asset_id else { return };
            let best_bid = env
                .bids
                .as_ref()
                .and_then(|levels| levels.iter().filter_map(|l| l.price.parse::<f64>().ok()).fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p)))));
            let best_ask = env
                .asks
                .as_ref()
                .and_then(|levels| levels.iter().filter_map(|l| l.price.parse::<f64>().ok()).fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p)))));
            let bid_size = best_bid.and_then(|bb| {
                env.bids.as_ref()?.iter().find(|l| l.price.parse::<f64>().ok() == Some(bb))?.size.parse::<f64>().ok()
            });
            let ask_size = best_ask.and_then(|ba| {
                env.asks.as_ref()?.iter().find(|l| l.price.parse::<f64>().ok() == Some(ba))?.size.parse::<f64>().ok()
            });

            if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
                out.push(StreamEvent::Price(PriceEvent {
                    asset_id,
                    bid,
                    ask,
                    bid_size,
                    ask_size,
                    kind: PriceEventKind::Book,
                    ts_ms: now_ms,
                }));
            }
        }
        Some("price_change") => {
            let Some(entries) = env.price_changes.filter(|e| !e.is_empty()) else { return };
            for entry in entries {
                let Some(bid) = parse_f64(&entry.best_bid) else { continue };
                let Some(ask) = parse_f64(&entry.best_ask) else { continue };
                out.push(StreamEvent::Price(PriceEvent {
                    asset_id: entry.asset_id,
                    bid,
                    ask,
                    bid_size: None,
                    ask_size: None,
                    kind: PriceEventKind::PriceChange,
                    ts_ms: now_ms,
                }));
            }
        }
        Some("update") | Some("price_changed") => {
            let Some(asset_id) = env.asset_id else { return };
            let Some(bid) = parse_f64(&env.best_bid) else { return };
            let Some(ask) = parse_f64(&env.best_ask) else { return };
            let kind = if env.event_type.as_deref() == Some("update") {
                PriceEventKind::Update
            } else {
                PriceEventKind::PriceChanged
            };
            out.push(StreamEvent::Price(PriceEvent {
                asset_id,
                bid,
                ask,
                bid_size: None,
                ask_size: None,
                kind,
                ts_ms: now_ms,
            }));
        }
        Some("last_trade_price") | Some("trade") => {
            let Some(asset_id) = env.asset_id else { return };
            let Some(price) = parse_f64(&env.price) else { return };
            let size = parse_f64(&env.size).unwrap_or(0.0);
            out.push(StreamEvent::Trade(TradeEvent {
                asset_id,
                price,
                size,
                side: env.side,
                ts_ms: now_ms,
            }));
        }
        _ => {}
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demuxes_book_snapshot() {
        let raw = r#"{"event_type":"book","asset_id":"tok1","asks":[{"price":"0.55","size":"100"}],"bids":[{"price":"0.54","size":"200"}]}"#;
        let events = demux_frame(raw, 1000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Price(p) => {
                assert_eq!(p.asset_id, "tok1");
                assert!((p.bid - 0.54).abs() < 1e-9);
                assert!((p.ask - 0.55).abs() < 1e-9);
                assert_eq!(p.kind, PriceEventKind::Book);
            }
            _ => panic!("expected Price event"),
        }
    }

    #[test]
    fn demuxes_price_change_array() {
        let raw = r#"{"event_type":"price_change","price_changes":[{"asset_id":"tok1","price":"0.55","size":"10","side":"SELL","best_bid":"0.52","best_ask":"0.55"},{"asset_id":"tok2","price":"0.45","size":"5","side":"BUY","best_bid":"0.45","best_ask":"0.47"}]}"#;
        let events = demux_frame(raw, 1000);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn demuxes_trade_event() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.57","size":"12000"}"#;
        let events = demux_frame(raw, 1000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Trade(t) => {
                assert_eq!(t.asset_id, "tok1");
                assert!((t.size - 12000.0).abs() < 1e-9);
            }
            _ => panic!("expected Trade event"),
        }
    }

    #[test]
    fn unknown_event_type_yields_nothing() {
        let raw = r#"{"event_type":"heartbeat"}"#;
        assert!(demux_frame(raw, 1000).is_empty());
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(demux_frame("not json", 1000).is_empty());
    }
}
