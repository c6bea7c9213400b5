//! Anomaly detector (4.I): pure functions over scalar cache entries and
//! rolling series. Each yields `Some(Alert)` or none; detectors never block
//! each other and share no state beyond the cache/rolling store they read.

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::config::anomaly::*;
use crate::rolling::RollingStore;
use crate::stats::{mean, pct_change, sample_std_dev, z_score};
use crate::types::{Alert, AlertPayload, Severity, TradePayload};

fn last_price_key(market_id: &str, outcome_id: &str) -> String {
    format!("last_price:{market_id}:{outcome_id}")
}

fn fat_finger_key(market_id: &str, outcome_id: &str) -> String {
    format!("fat_finger:{market_id}:{outcome_id}")
}

fn depth_key(market_id: &str, outcome_id: &str) -> String {
    format!("depth:{market_id}:{outcome_id}")
}

fn trades_key(token_id: &str) -> String {
    format!("trades:{token_id}")
}

fn base_alert(
    severity: Severity,
    market_id: &str,
    outcome_id: &str,
    payload: AlertPayload,
    message: String,
    ts_ms: i64,
) -> Alert {
    Alert {
        severity,
        market_id: market_id.to_string(),
        outcome_id: Some(outcome_id.to_string()),
        token_id: None,
        outcome_name: None,
        message,
        payload,
        timestamp_ms: ts_ms,
        extras: Default::default(),
    }
}

/// Precursor to `insider_move`. Compares the new mid price against the
/// scalar cached under `last_price:<m>:<o>`, then always refreshes it.
pub async fn price_velocity(
    cache: &Cache,
    market_id: &str,
    outcome_id: &str,
    current_price: f64,
    now_ms: i64,
) -> Option<Alert> {
    let key = last_price_key(market_id, outcome_id);
    let raw = cache.get(&key).await;

    let result = raw.and_then(|s| {
        let mut parts = s.splitn(2, ':');
        let ts: i64 = parts.next()?.parse().ok()?;
        let price: f64 = parts.next()?.parse().ok()?;
        if now_ms - ts > PRICE_VELOCITY_STALE_SECS * 1000 {
            return None;
        }
        Some((ts, price))
    });

    let alert = result.and_then(|(ts, last_price)| {
        if !(0.0..=1.0).contains(&last_price) || !(0.0..=1.0).contains(&current_price) {
            return None;
        }
        let absolute_change = (current_price - last_price).abs();
        if absolute_change <= PRICE_VELOCITY_THRESHOLD {
            return None;
        }
        let dt_secs = ((now_ms - ts).max(0) as f64) / 1000.0;
        Some(base_alert(
            Severity::High,
            market_id,
            outcome_id,
            AlertPayload::PriceVelocity {
                last_price,
                current_price,
                absolute_change,
                percentage_change: pct_change(last_price, current_price),
                dt_secs,
            },
            format!("Price velocity: {last_price:.3} -> {current_price:.3}"),
            now_ms,
        ))
    });

    cache
        .setex(&key, &format!("{now_ms}:{current_price}"), PRICE_VELOCITY_TTL_SECS as u64)
        .await;

    alert
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TradeSample {
    ts_ms: i64,
    usdc: f64,
}

/// Reads the last 60 minutes of trades, buckets by minute (excluding the
/// in-progress bucket), and compares the current minute's volume against
/// the historical bucket distribution via a z-score.
pub async fn volume_acceleration(
    rolling: &RollingStore,
    token_id: &str,
    current_minute_usdc: f64,
    now_ms: i64,
) -> Option<Alert> {
    if current_minute_usdc < VOLUME_MIN_CURRENT_USDC {
        return None;
    }

    let key = trades_key(token_id);
    let from_ms = now_ms - VOLUME_LOOKBACK_MINUTES * 60_000;
    let trades: Vec<(i64, TradePayload)> = rolling.range_by_time(&key, from_ms, now_ms).await;
    if trades.len() < VOLUME_MIN_TRADES {
        return None;
    }

    let current_bucket = floor_minute(now_ms);
    let mut buckets: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
    for (ts, trade) in &trades {
        let bucket = floor_minute(*ts);
        if bucket == current_bucket {
            continue;
        }
        *buckets.entry(bucket).or_insert(0.0) += trade.size_usdc;
    }

    if buckets.len() < VOLUME_MIN_HISTORICAL_BUCKETS {
        return None;
    }

    let historical: Vec<f64> = buckets.values().copied().collect();
    let avg = mean(&historical);
    let stddev = sample_std_dev(&historical);
    let z = z_score(current_minute_usdc, avg, stddev)?;

    if z > VOLUME_Z_UNPHYSICAL {
        return None;
    }
    if z <= VOLUME_Z_THRESHOLD {
        return None;
    }

    Some(Alert {
        severity: Severity::Medium,
        market_id: String::new(),
        outcome_id: None,
        token_id: Some(token_id.to_string()),
        outcome_name: None,
        message: format!("Volume acceleration: z={z:.2}"),
        payload: AlertPayload::VolumeAcceleration {
            current_volume: current_minute_usdc,
            average_volume: avg,
            stddev,
            z,
        },
        timestamp_ms: now_ms,
        extras: Default::default(),
    })
}

fn floor_minute(ts_ms: i64) -> i64 {
    (ts_ms / 60_000) * 60_000
}

/// `price_velocity ∧ volume_acceleration`; composed by the caller (4.H),
/// since both detectors are invoked independently on the same event.
pub fn insider_move(
    velocity: &Alert,
    volume: &Alert,
    market_id: &str,
    outcome_id: &str,
    now_ms: i64,
) -> Alert {
    let (last_price, current_price, absolute_change) = match velocity.payload {
        AlertPayload::PriceVelocity {
            last_price,
            current_price,
            absolute_change,
            ..
        } => (last_price, current_price, absolute_change),
        _ => (0.0, 0.0, 0.0),
    };
    let volume_z = match volume.payload {
        AlertPayload::VolumeAcceleration { z, .. } => z,
        _ => 0.0,
    };

    base_alert(
        Severity::Critical,
        market_id,
        outcome_id,
        AlertPayload::InsiderMove {
            last_price,
            current_price,
            absolute_change,
            volume_z,
        },
        format!("Insider move suspected: price jump with volume z={volume_z:.2}"),
        now_ms,
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FatFingerEntry {
    price: f64,
    ts_ms: i64,
}

/// Tracks the last 3 trade prices per `(market, outcome)`. A sharp move
/// followed by a sharp reversion (smaller than the initial deviation) is
/// flagged as a likely erroneous trade.
pub async fn fat_finger(
    cache: &Cache,
    market_id: &str,
    outcome_id: &str,
    price: f64,
    now_ms: i64,
) -> Option<Alert> {
    let key = fat_finger_key(market_id, outcome_id);
    let raw = cache.get(&key).await;
    let mut history: Vec<FatFingerEntry> = raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    history.push(FatFingerEntry { price, ts_ms: now_ms });
    if history.len() > 3 {
        history.remove(0);
    }

    let alert = if history.len() == 3 {
        let initial_deviation = pct_change(history[0].price, history[1].price);
        let reversion_change = pct_change(history[1].price, history[2].price);
        if initial_deviation.abs() > FAT_FINGER_INITIAL_DEVIATION
            && reversion_change.abs() > FAT_FINGER_REVERSION_THRESHOLD
            && reversion_change.abs() < initial_deviation.abs()
        {
            Some(base_alert(
                Severity::Medium,
                market_id,
                outcome_id,
                AlertPayload::FatFinger {
                    percentage_change: initial_deviation,
                    reversion_change,
                },
                "Fat-finger trade: sharp move with reversion".to_string(),
                now_ms,
            ))
        } else {
            None
        }
    } else {
        None
    };

    if let Ok(payload) = serde_json::to_string(&history) {
        cache.setex(&key, &payload, FAT_FINGER_TTL_SECS as u64).await;
    }

    alert
}

/// `spread > 0.10` alerts immediately; otherwise compares current depth
/// against the last stored depth within 60s for a sudden collapse.
pub async fn liquidity_vacuum(
    cache: &Cache,
    market_id: &str,
    outcome_id: &str,
    spread: f64,
    depth: f64,
    now_ms: i64,
) -> Option<Alert> {
    if spread > LIQUIDITY_SPREAD_THRESHOLD {
        cache
            .setex(&depth_key(market_id, outcome_id), &format!("{now_ms}:{depth}"), LIQUIDITY_DEPTH_TTL_SECS as u64)
            .await;
        return Some(base_alert(
            Severity::High,
            market_id,
            outcome_id,
            AlertPayload::LiquidityVacuum {
                spread: Some(spread),
                depth_drop_pct: None,
            },
            format!("Liquidity vacuum: spread {spread:.3}"),
            now_ms,
        ));
    }

    let key = depth_key(market_id, outcome_id);
    let raw = cache.get(&key).await;
    let prior = raw.and_then(|s| {
        let mut parts = s.splitn(2, ':');
        let ts: i64 = parts.next()?.parse().ok()?;
        let d: f64 = parts.next()?.parse().ok()?;
        if now_ms - ts > LIQUIDITY_DEPTH_LOOKBACK_SECS * 1000 {
            return None;
        }
        Some(d)
    });

    let alert = prior.and_then(|last_depth| {
        if last_depth <= 0.0 {
            return None;
        }
        let drop_pct = (last_depth - depth) / last_depth;
        if drop_pct > LIQUIDITY_DEPTH_DROP_THRESHOLD {
            Some(base_alert(
                Severity::High,
                market_id,
                outcome_id,
                AlertPayload::LiquidityVacuum {
                    spread: None,
                    depth_drop_pct: Some(drop_pct),
                },
                format!("Liquidity vacuum: depth dropped {:.0}%", drop_pct * 100.0),
                now_ms,
            ))
        } else {
            None
        }
    });

    cache
        .setex(&key, &format!("{now_ms}:{depth}"), LIQUIDITY_DEPTH_TTL_SECS as u64)
        .await;

    alert
}

pub fn whale_trade(market_id: &str, outcome_id: &str, trade_size_usdc: f64, now_ms: i64) -> Option<Alert> {
    if trade_size_usdc < WHALE_TRADE_USDC {
        return None;
    }
    Some(base_alert(
        Severity::Medium,
        market_id,
        outcome_id,
        AlertPayload::WhaleTrade {
            trade_size: trade_size_usdc,
        },
        format!("Whale trade: ${trade_size_usdc:.0}"),
        now_ms,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_minute_buckets_correctly() {
        assert_eq!(floor_minute(65_000), 60_000);
        assert_eq!(floor_minute(59_999), 0);
    }

    #[test]
    fn whale_trade_threshold() {
        assert!(whale_trade("m", "o", 9_999.0, 0).is_none());
        assert!(whale_trade("m", "o", 10_000.0, 0).is_some());
    }

    #[test]
    fn insider_move_combines_both_payloads() {
        let velocity = base_alert(
            Severity::High,
            "m",
            "o",
            AlertPayload::PriceVelocity {
                last_price: 0.5,
                current_price: 0.7,
                absolute_change: 0.2,
                percentage_change: 0.4,
                dt_secs: 1.0,
            },
            "x".into(),
            0,
        );
        let volume = Alert {
            severity: Severity::Medium,
            market_id: "m".into(),
            outcome_id: None,
            token_id: None,
            outcome_name: None,
            message: "y".into(),
            payload: AlertPayload::VolumeAcceleration {
                current_volume: 500.0,
                average_volume: 100.0,
                stddev: 50.0,
                z: 8.0,
            },
            timestamp_ms: 0,
            extras: Default::default(),
        };
        let combined = insider_move(&velocity, &volume, "m", "o", 1000);
        assert_eq!(combined.severity, Severity::Critical);
        match combined.payload {
            AlertPayload::InsiderMove { volume_z, .. } => assert!((volume_z - 8.0).abs() < 1e-9),
            _ => panic!("expected InsiderMove payload"),
        }
    }
}
