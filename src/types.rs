use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Market / Outcome / PriceHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub slug: String,
    pub category: Category,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub image_url: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub question_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub market_id: String,
    pub name: String,
    pub token_id: String,
    pub volume: f64,
    pub volume_24h: f64,
}

/// VARCHAR(100) in D; truncated at the write boundary, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Category {
    Crypto,
    Politics,
    Sports,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Crypto => "Crypto",
            Category::Politics => "Politics",
            Category::Sports => "Sports",
            Category::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceHistoryRow {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub implied_probability: f64,
    pub timestamp_ms: i64,
}

impl PriceHistoryRow {
    pub fn new(bid: f64, ask: f64, timestamp_ms: i64) -> Self {
        let mid = (bid + ask) / 2.0;
        Self {
            bid,
            ask,
            mid,
            implied_probability: mid * 100.0,
            timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream events — produced by the venue stream client, consumed by ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceEventKind {
    PriceChange,
    Book,
    Update,
    PriceChanged,
}

/// Canonical price event. `bid_size`/`ask_size` are only populated for
/// `Book`-kind events (full snapshot) and feed the liquidity-vacuum depth
/// check; other kinds carry only the touched side's best prices.
#[derive(Debug, Clone)]
pub struct PriceEvent {
    pub asset_id: String,
    pub bid: f64,
    pub ask: f64,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub kind: PriceEventKind,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub asset_id: String,
    pub price: f64,
    pub size: f64,
    pub side: Option<String>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Price(PriceEvent),
    Trade(TradeEvent),
}

/// Normalized update broadcast to downstream consumers (read API, M).
#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    pub market_id: String,
    pub outcome_id: String,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub implied_probability: f64,
    pub ts_ms: i64,
}

// ---------------------------------------------------------------------------
// Rolling-series payloads (4.B)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradePayload {
    pub size: f64,
    pub size_usdc: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderbookPayload {
    pub spread: f64,
    pub depth: f64,
    pub bid: f64,
    pub ask: f64,
}

// ---------------------------------------------------------------------------
// Alerts — tagged union keyed by `type` (9. DESIGN NOTES: "untyped alert
// payloads... a trap")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertPayload {
    PriceVelocity {
        last_price: f64,
        current_price: f64,
        absolute_change: f64,
        percentage_change: f64,
        dt_secs: f64,
    },
    InsiderMove {
        last_price: f64,
        current_price: f64,
        absolute_change: f64,
        volume_z: f64,
    },
    VolumeAcceleration {
        current_volume: f64,
        average_volume: f64,
        stddev: f64,
        z: f64,
    },
    FatFinger {
        percentage_change: f64,
        reversion_change: f64,
    },
    LiquidityVacuum {
        spread: Option<f64>,
        depth_drop_pct: Option<f64>,
    },
    WhaleTrade {
        trade_size: f64,
    },
    NewMarket {
        question: String,
    },
    NewOutcome {
        outcome_name: String,
    },
}

impl AlertPayload {
    /// The `type` discriminant, used for cooldown lookup and templating.
    pub fn kind(&self) -> &'static str {
        match self {
            AlertPayload::PriceVelocity { .. } => "price_velocity",
            AlertPayload::InsiderMove { .. } => "insider_move",
            AlertPayload::VolumeAcceleration { .. } => "volume_acceleration",
            AlertPayload::FatFinger { .. } => "fat_finger",
            AlertPayload::LiquidityVacuum { .. } => "liquidity_vacuum",
            AlertPayload::WhaleTrade { .. } => "whale_trade",
            AlertPayload::NewMarket { .. } => "new_market",
            AlertPayload::NewOutcome { .. } => "new_outcome",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub market_id: String,
    pub outcome_id: Option<String>,
    pub token_id: Option<String>,
    pub outcome_name: Option<String>,
    pub message: String,
    pub payload: AlertPayload,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub extras: HashMap<String, serde_json::Value>,
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------------
// Control messages — stream subscription management (4.F/4.G handoff)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ControlMsg {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Resets the reconnect-attempt counter after a surrendered stream
    /// client has gone idle (4.F: "calling `connect()` again resets").
    Reconnect,
}
