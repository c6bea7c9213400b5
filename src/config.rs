use crate::error::{AppError, Result};

pub const DEFAULT_STREAM_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const DEFAULT_GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const DEFAULT_CLOB_API_URL: &str = "https://clob.polymarket.com";

/// Channel capacity for internal message routing (4.F → 4.H handoff buffer).
pub const CHANNEL_CAPACITY: usize = 1024;

/// WS heartbeat interval (4.F).
pub const WS_PING_INTERVAL_SECS: u64 = 5;
/// WS reconnect backoff: 1s doubling to a 30s cap.
pub const WS_BACKOFF_BASE_MS: u64 = 1_000;
pub const WS_BACKOFF_CAP_MS: u64 = 30_000;
/// Max reconnect attempts before surrendering (next `connect()` resets).
pub const WS_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Max asset ids per WS subscribe frame.
pub const WS_SUBSCRIBE_CHUNK_SIZE: usize = 500;

/// 4.G sync algorithm constants.
pub mod sync {
    pub const PAGE_SIZE: usize = 100;
    pub const MAX_EMPTY_PAGES: u32 = 3;
    /// Discovery loop stop condition (4.G step 2): collect until this many
    /// markets are gathered or `MAX_EMPTY_PAGES` consecutive empty/errored
    /// pages occur, whichever comes first.
    pub const MAX_MARKETS_PER_CYCLE: usize = 5_000;
    pub const FRESH_DEPLOYMENT_THRESHOLD: i64 = 10;
    pub const QUESTION_ID_LOOKUP_TIMEOUT_SECS: u64 = 2;
    pub const MAX_SUBSCRIBE_BATCH: usize = 100;
    /// Pruning runs roughly every Kth sync cycle (~6h at a 5-minute cadence).
    pub const PRUNE_EVERY_N_CYCLES: u64 = 72;
}

/// 4.H ingestion thresholds.
pub mod ingest {
    pub const PERSIST_CHANGE_THRESHOLD: f64 = 0.01;
    pub const PERSIST_MAX_AGE_SECS: i64 = 60;
    pub const TRADE_SERIES_MAX_AGE_MS: i64 = 3_600_000;
    pub const TRADE_SERIES_MAX_ITEMS: usize = 1_000;
}

/// 4.I anomaly detector thresholds.
pub mod anomaly {
    pub const PRICE_VELOCITY_TTL_SECS: i64 = 120;
    pub const PRICE_VELOCITY_STALE_SECS: i64 = 60;
    pub const PRICE_VELOCITY_THRESHOLD: f64 = 0.15;

    pub const VOLUME_MIN_CURRENT_USDC: f64 = 100.0;
    pub const VOLUME_LOOKBACK_MINUTES: i64 = 60;
    pub const VOLUME_MIN_TRADES: usize = 10;
    pub const VOLUME_MIN_HISTORICAL_BUCKETS: usize = 5;
    pub const VOLUME_Z_THRESHOLD: f64 = 3.0;
    pub const VOLUME_Z_UNPHYSICAL: f64 = 50.0;

    pub const FAT_FINGER_TTL_SECS: i64 = 300;
    pub const FAT_FINGER_INITIAL_DEVIATION: f64 = 0.30;
    pub const FAT_FINGER_REVERSION_THRESHOLD: f64 = 0.20;

    pub const LIQUIDITY_SPREAD_THRESHOLD: f64 = 0.10;
    pub const LIQUIDITY_DEPTH_TTL_SECS: i64 = 120;
    pub const LIQUIDITY_DEPTH_LOOKBACK_SECS: i64 = 60;
    pub const LIQUIDITY_DEPTH_DROP_THRESHOLD: f64 = 0.80;

    pub const WHALE_TRADE_USDC: f64 = 10_000.0;
}

/// 4.J new-entity detector.
pub mod new_entity {
    pub const KNOWN_SET_TTL_SECS: i64 = 30 * 24 * 3600;
    pub const SEVERITY_KEYWORDS: &[&str] = &[
        "war", "conflict", "attack", "invasion", "launch", "release", "announcement",
        "hack", "breach", "exploit", "vulnerability", "election", "vote", "poll",
        "ipo", "merger", "acquisition", "regulation", "ban", "approval", "disaster",
        "crisis", "emergency",
    ];
}

/// 4.K throttle defaults.
pub mod throttle {
    pub const DEFAULT_COOLDOWN_SECS: i64 = 600;
    pub const TYPE_COOLDOWNS: &[(&str, i64)] = &[
        ("insider_move", 600),
        ("fat_finger", 300),
        ("liquidity_vacuum", 300),
        ("whale_trade", 60),
        ("volume_acceleration", 600),
    ];
}

/// 4.L dispatcher timing.
pub mod dispatcher {
    pub const PROCESS_TICK_SECS: u64 = 2;
    pub const CLEANUP_TICK_SECS: u64 = 300;
    pub const MAX_AGE_SECS: i64 = 600;
    pub const CLEANUP_AGE_SECS: i64 = 1_800;
    pub const STARTUP_SCAN_LIMIT: usize = 1_000;
    pub const CLEANUP_SCAN_LIMIT: usize = 100;
}

/// 4.M notification channel defaults.
pub mod channels {
    pub const WEBHOOK_TIMEOUT_MS: u64 = 5_000;
    pub const WEBHOOK_RETRY_ATTEMPTS: u32 = 3;
    pub const WEBHOOK_BACKOFF_MS: &[u64] = &[1_000, 2_000, 4_000];
    pub const EMBED_HOST_SUFFIXES: &[&str] = &["discord.com", "discordapp.com", "slack.com"];
}

#[derive(Debug, Clone)]
pub struct Config {
    pub stream_url: String,
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub log_level: String,
    pub database_url: String,
    pub redis_url: String,
    pub api_port: u16,

    /// SYNC_INTERVAL_MINUTES
    pub sync_interval_minutes: u64,
    /// DISCOVERY_INTERVAL_MINUTES
    pub discovery_interval_minutes: u64,

    /// ALERT_THROTTLE_COOLDOWN_SECONDS
    pub alert_throttle_cooldown_secs: i64,
    /// CRITICAL_BYPASS_THROTTLE
    pub critical_bypass_throttle: bool,
    /// per-severity cooldown overrides (4.K: "severity override if present,
    /// else per-type, else default"). `None` unless explicitly set in env.
    pub severity_cooldown_high_secs: Option<i64>,
    pub severity_cooldown_medium_secs: Option<i64>,
    pub severity_cooldown_low_secs: Option<i64>,

    /// WEBHOOK_ENABLED / WEBHOOK_URL / WEBHOOK_SECRET / WEBHOOK_TIMEOUT_MS / WEBHOOK_RETRY_ATTEMPTS
    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_timeout_ms: u64,
    pub webhook_retry_attempts: u32,

    /// BROADCAST_ALERTS_ENABLED
    pub broadcast_alerts_enabled: bool,
    /// EMAIL_ENABLED
    pub email_enabled: bool,

    /// PERSISTENCE_RETENTION_DAYS
    pub persistence_retention_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            stream_url: env_or("STREAM_URL", DEFAULT_STREAM_URL),
            gamma_api_url: env_or("GAMMA_API_URL", DEFAULT_GAMMA_API_URL),
            clob_api_url: env_or("CLOB_API_URL", DEFAULT_CLOB_API_URL),
            log_level: env_or("LOG_LEVEL", "info"),
            database_url: std::env::var("DATABASE_URL").map_err(|_| {
                AppError::Config("DATABASE_URL must be set".to_string())
            })?,
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            api_port: env_or("API_PORT", "3000")
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,

            sync_interval_minutes: parse_or("SYNC_INTERVAL_MINUTES", 5),
            discovery_interval_minutes: parse_or("DISCOVERY_INTERVAL_MINUTES", 30),

            alert_throttle_cooldown_secs: parse_or("ALERT_THROTTLE_COOLDOWN_SECONDS", 600),
            critical_bypass_throttle: parse_or("CRITICAL_BYPASS_THROTTLE", true),
            severity_cooldown_high_secs: env_parsed("SEVERITY_COOLDOWN_HIGH_SECONDS"),
            severity_cooldown_medium_secs: env_parsed("SEVERITY_COOLDOWN_MEDIUM_SECONDS"),
            severity_cooldown_low_secs: env_parsed("SEVERITY_COOLDOWN_LOW_SECONDS"),

            webhook_enabled: parse_or("WEBHOOK_ENABLED", false),
            webhook_url: std::env::var("WEBHOOK_URL").ok(),
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok(),
            webhook_timeout_ms: parse_or("WEBHOOK_TIMEOUT_MS", 5_000),
            webhook_retry_attempts: parse_or("WEBHOOK_RETRY_ATTEMPTS", 3),

            broadcast_alerts_enabled: parse_or("BROADCAST_ALERTS_ENABLED", true),
            email_enabled: parse_or("EMAIL_ENABLED", false),

            persistence_retention_days: parse_or("PERSISTENCE_RETENTION_DAYS", 1),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
