pub mod channels;
pub mod dispatcher;
pub mod throttle;

use crate::cache::Cache;
use crate::types::Alert;

const PENDING_KEY: &str = "alerts:pending";
const PENDING_TTL_SECS: i64 = 3600;

fn market_key(market_id: &str) -> String {
    format!("alerts:market:{market_id}")
}

/// Pushes to `alerts:pending` head, mirrors to `alerts:market:<id>` head,
/// refreshes the 1h TTL on both (4.I: "Alert emission"). Detectors call this
/// directly so the pending list reflects detection order before the
/// dispatcher can pop.
pub async fn enqueue(cache: &Cache, alert: &Alert) {
    let Ok(payload) = serde_json::to_string(alert) else {
        return;
    };
    cache.l_push_head(PENDING_KEY, &payload).await;
    cache.expire(PENDING_KEY, PENDING_TTL_SECS).await;

    let mkey = market_key(&alert.market_id);
    cache.l_push_head(&mkey, &payload).await;
    cache.expire(&mkey, PENDING_TTL_SECS).await;
}
