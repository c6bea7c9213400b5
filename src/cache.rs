//! Typed KV/cache capability (4.C) over Redis. Every call degrades to an
//! absent/no-op result on connection failure rather than propagating —
//! callers must already tolerate absence (STORE_UNAVAILABLE policy, §7).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> crate::error::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.conn().get::<_, Option<String>>(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key, "cache get failed: {e}");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.conn().set::<_, _, ()>(key, value).await {
            warn!(key, "cache set failed: {e}");
        }
    }

    pub async fn setex(&self, key: &str, value: &str, ttl_secs: u64) {
        if let Err(e) = self.conn().set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(key, "cache setex failed: {e}");
        }
    }

    pub async fn del(&self, key: &str) {
        if let Err(e) = self.conn().del::<_, ()>(key).await {
            warn!(key, "cache del failed: {e}");
        }
    }

    /// Best-effort pattern delete via SCAN + DEL (no KEYS — avoids blocking on
    /// a large keyspace). Grounded on `aaronwald-ssmd`'s `del_pattern`.
    pub async fn del_pattern(&self, pattern: &str) {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = match redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(pattern, "cache scan failed: {e}");
                    return;
                }
            };
            if !keys.is_empty() {
                if let Err(e) = conn.del::<_, ()>(keys).await {
                    warn!(pattern, "cache del_pattern batch failed: {e}");
                }
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
    }

    pub async fn incr(&self, key: &str) -> Option<i64> {
        match self.conn().incr::<_, _, i64>(key, 1).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, "cache incr failed: {e}");
                None
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) {
        if let Err(e) = self.conn().expire::<_, ()>(key, ttl_secs).await {
            warn!(key, "cache expire failed: {e}");
        }
    }

    // --- sets ---

    pub async fn s_add(&self, key: &str, member: &str) {
        if let Err(e) = self.conn().sadd::<_, _, ()>(key, member).await {
            warn!(key, "cache sadd failed: {e}");
        }
    }

    pub async fn s_is_member(&self, key: &str, member: &str) -> bool {
        self.conn()
            .sismember::<_, _, bool>(key, member)
            .await
            .unwrap_or_else(|e| {
                warn!(key, "cache sismember failed: {e}");
                false
            })
    }

    pub async fn s_members(&self, key: &str) -> Vec<String> {
        self.conn().smembers(key).await.unwrap_or_else(|e| {
            warn!(key, "cache smembers failed: {e}");
            Vec::new()
        })
    }

    // --- lists ---

    pub async fn l_push_head(&self, key: &str, value: &str) {
        if let Err(e) = self.conn().lpush::<_, _, ()>(key, value).await {
            warn!(key, "cache lpush failed: {e}");
        }
    }

    pub async fn l_pop_head(&self, key: &str) -> Option<String> {
        self.conn().lpop(key, None).await.unwrap_or_else(|e| {
            warn!(key, "cache lpop head failed: {e}");
            None
        })
    }

    pub async fn l_pop_tail(&self, key: &str) -> Option<String> {
        self.conn().rpop(key, None).await.unwrap_or_else(|e| {
            warn!(key, "cache lpop tail failed: {e}");
            None
        })
    }

    pub async fn l_index(&self, key: &str, idx: isize) -> Option<String> {
        self.conn()
            .lindex(key, idx)
            .await
            .unwrap_or_else(|e| {
                warn!(key, "cache lindex failed: {e}");
                None
            })
    }

    pub async fn l_range(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        self.conn().lrange(key, start, stop).await.unwrap_or_else(|e| {
            warn!(key, "cache lrange failed: {e}");
            Vec::new()
        })
    }

    pub async fn l_len(&self, key: &str) -> i64 {
        self.conn().llen(key).await.unwrap_or_else(|e| {
            warn!(key, "cache llen failed: {e}");
            0
        })
    }

    // --- sorted sets (used by the rolling-window store, 4.B) ---

    pub async fn z_add(&self, key: &str, score: f64, member: &str) {
        if let Err(e) = self.conn().zadd::<_, _, _, ()>(key, member, score).await {
            warn!(key, "cache zadd failed: {e}");
        }
    }

    pub async fn z_range_by_score(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        self.conn()
            .zrangebyscore(key, min, max)
            .await
            .unwrap_or_else(|e| {
                warn!(key, "cache zrangebyscore failed: {e}");
                Vec::new()
            })
    }

    pub async fn z_rev_range(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        self.conn()
            .zrevrange(key, start, stop)
            .await
            .unwrap_or_else(|e| {
                warn!(key, "cache zrevrange failed: {e}");
                Vec::new()
            })
    }

    pub async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) {
        if let Err(e) = self
            .conn()
            .zrembyscore::<_, _, _, ()>(key, min, max)
            .await
        {
            warn!(key, "cache zremrangebyscore failed: {e}");
        }
    }

    pub async fn z_rem_range_by_rank(&self, key: &str, start: isize, stop: isize) {
        if let Err(e) = self
            .conn()
            .zremrangebyrank::<_, ()>(key, start, stop)
            .await
        {
            warn!(key, "cache zremrangebyrank failed: {e}");
        }
    }

    pub async fn z_card(&self, key: &str) -> i64 {
        self.conn().zcard(key).await.unwrap_or_else(|e| {
            warn!(key, "cache zcard failed: {e}");
            0
        })
    }

    // --- hashes ---

    pub async fn h_set(&self, key: &str, field: &str, value: &str) {
        if let Err(e) = self.conn().hset::<_, _, _, ()>(key, field, value).await {
            warn!(key, field, "cache hset failed: {e}");
        }
    }

    pub async fn h_get_all(&self, key: &str) -> std::collections::HashMap<String, String> {
        self.conn().hgetall(key).await.unwrap_or_else(|e| {
            warn!(key, "cache hgetall failed: {e}");
            std::collections::HashMap::new()
        })
    }

    /// Set a TTL on the whole hash. Redis predates per-field `HEXPIRE` in
    /// widely deployed versions, so this approximates it with a key-level
    /// `EXPIRE` — acceptable since `market:<id>:prices` is always rewritten
    /// wholesale on invalidation.
    pub async fn h_expire(&self, key: &str, ttl_secs: i64) {
        self.expire(key, ttl_secs).await;
    }
}
