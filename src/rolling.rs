//! Rolling-window store (4.B): a bounded, self-evicting time-indexed series
//! per key, built on top of the KV/cache capability's sorted-set ops.

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::Cache;

#[derive(Clone)]
pub struct RollingStore {
    cache: Cache,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollingWindowStats {
    pub count: i64,
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
}

impl RollingStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Append `value` at `ts_ms`, then evict anything older than
    /// `now - max_age_ms` and trim to at most `max_items` (keeping the
    /// newest). Refreshes the key TTL per the 4.B contract.
    pub async fn add<T: Serialize>(
        &self,
        key: &str,
        ts_ms: i64,
        value: &T,
        max_age_ms: i64,
        max_items: usize,
        now_ms: i64,
    ) {
        let seq_key = format!("{key}:seq");
        let nonce = self.cache.incr(&seq_key).await.unwrap_or(0);
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(_) => return,
        };
        let member = format!("{ts_ms}:{nonce}:{payload}");
        self.cache.z_add(key, ts_ms as f64, &member).await;

        let cutoff = (now_ms - max_age_ms) as f64;
        self.cache.z_rem_range_by_score(key, f64::NEG_INFINITY, cutoff).await;

        let count = self.cache.z_card(key).await;
        if count > max_items as i64 {
            let excess = count - max_items as i64;
            self.cache.z_rem_range_by_rank(key, 0, excess - 1).await;
        }

        let ttl = ((max_age_ms as f64 / 1000.0).ceil() as i64) + 3_600;
        self.cache.expire(key, ttl).await;
        self.cache.expire(&seq_key, ttl).await;
    }

    /// Inclusive on both ends.
    pub async fn range_by_time<T: DeserializeOwned>(
        &self,
        key: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Vec<(i64, T)> {
        let members = self
            .cache
            .z_range_by_score(key, from_ms as f64, to_ms as f64)
            .await;
        members.iter().filter_map(|m| decode_member(m)).collect()
    }

    /// Newest `n` entries, newest first.
    pub async fn latest<T: DeserializeOwned>(&self, key: &str, n: usize) -> Vec<(i64, T)> {
        if n == 0 {
            return Vec::new();
        }
        let members = self.cache.z_rev_range(key, 0, n as isize - 1).await;
        members.iter().filter_map(|m| decode_member(m)).collect()
    }

    pub async fn count(&self, key: &str) -> i64 {
        self.cache.z_card(key).await
    }

    pub async fn stats(&self, key: &str) -> RollingWindowStats {
        let count = self.count(key).await;
        if count == 0 {
            return RollingWindowStats::default();
        }
        let oldest = self.cache.z_range_by_score(key, f64::NEG_INFINITY, f64::INFINITY).await;
        let oldest_ts = oldest.first().and_then(|m| member_ts(m));
        let newest = self.cache.z_rev_range(key, 0, 0).await;
        let newest_ts = newest.first().and_then(|m| member_ts(m));
        RollingWindowStats {
            count,
            oldest_ts,
            newest_ts,
        }
    }

    pub async fn delete(&self, key: &str) {
        self.cache.del(key).await;
        self.cache.del(&format!("{key}:seq")).await;
    }
}

fn member_ts(member: &str) -> Option<i64> {
    member.split(':').next()?.parse().ok()
}

fn decode_member<T: DeserializeOwned>(member: &str) -> Option<(i64, T)> {
    let mut parts = member.splitn(3, ':');
    let ts: i64 = parts.next()?.parse().ok()?;
    let _nonce = parts.next()?;
    let payload = parts.next()?;
    let value: T = serde_json::from_str(payload).ok()?;
    Some((ts, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_member_roundtrips() {
        let member = "1000:7:{\"size\":1.0,\"size_usdc\":2.0,\"price\":0.5}";
        let (ts, payload): (i64, crate::types::TradePayload) = decode_member(member).unwrap();
        assert_eq!(ts, 1000);
        assert!((payload.price - 0.5).abs() < 1e-9);
    }

    #[test]
    fn member_ts_parses_prefix() {
        assert_eq!(member_ts("1234:5:{}"), Some(1234));
        assert_eq!(member_ts("garbage"), None);
    }
}
