//! Shared health state for the `/health` endpoint (Component O). Updated by
//! the stream client, sync engine, and ingestion; read by the API.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// True once the venue stream reaches `Subscribed`.
    pub stream_connected: AtomicBool,
    /// Millisecond timestamp of the last completed sync cycle (0 = none).
    pub last_sync_at_ms: AtomicI64,
    /// Number of markets written by the last sync cycle.
    pub last_sync_written: AtomicU64,
    /// Outcomes currently known to the in-memory token index.
    pub token_index_size: AtomicU64,
    /// Markets that have produced a price event at least once.
    pub active_market_count: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stream_connected(&self, v: bool) {
        self.stream_connected.store(v, Ordering::Relaxed);
    }

    pub fn record_sync_cycle(&self, at_ms: i64, written: usize) {
        self.last_sync_at_ms.store(at_ms, Ordering::Relaxed);
        self.last_sync_written.store(written as u64, Ordering::Relaxed);
    }

    pub fn set_token_index_size(&self, n: usize) {
        self.token_index_size.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_active_market_count(&self, n: usize) {
        self.active_market_count.store(n as u64, Ordering::Relaxed);
    }

    pub fn stream_connected(&self) -> bool {
        self.stream_connected.load(Ordering::Relaxed)
    }

    pub fn last_sync_at_ms(&self) -> i64 {
        self.last_sync_at_ms.load(Ordering::Relaxed)
    }

    pub fn last_sync_written(&self) -> u64 {
        self.last_sync_written.load(Ordering::Relaxed)
    }

    pub fn token_index_size(&self) -> u64 {
        self.token_index_size.load(Ordering::Relaxed)
    }

    pub fn active_market_count(&self) -> u64 {
        self.active_market_count.load(Ordering::Relaxed)
    }
}
