//! Market Sync Engine (4.G): discovers markets from the venue, suppresses
//! child/bucket duplicates, categorizes, reconciles into D, and hands off
//! newly-seen token ids for stream subscription.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::config::sync::{
    FRESH_DEPLOYMENT_THRESHOLD, MAX_EMPTY_PAGES, MAX_MARKETS_PER_CYCLE, MAX_SUBSCRIBE_BATCH,
    PAGE_SIZE, PRUNE_EVERY_N_CYCLES, QUESTION_ID_LOOKUP_TIMEOUT_SECS,
};
use crate::db::store::{parse_category, Store};
use crate::detect::new_entity;
use crate::market_index::TokenIndex;
use crate::types::{Category, ControlMsg, Market, Outcome, PriceHistoryRow};
use crate::venue::rest::{FetchMarketsParams, NormalizedMarket, RestClient};
use crate::{alert, config};

pub struct SyncEngine {
    store: Store,
    cache: Cache,
    rest: RestClient,
    control_tx: mpsc::Sender<ControlMsg>,
    token_index: TokenIndex,
    in_progress: Arc<AtomicBool>,
    cycle_count: Arc<AtomicU64>,
    retention_days: i64,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        cache: Cache,
        rest: RestClient,
        control_tx: mpsc::Sender<ControlMsg>,
        token_index: TokenIndex,
        retention_days: i64,
    ) -> Self {
        Self {
            store,
            cache,
            rest,
            control_tx,
            token_index,
            in_progress: Arc::new(AtomicBool::new(false)),
            cycle_count: Arc::new(AtomicU64::new(0)),
            retention_days,
        }
    }

    /// Runs the periodic sync ticker; overlapping ticks are skipped rather
    /// than queued (5. CONCURRENCY: "if a tick fires while the previous run
    /// is active, the new tick is skipped").
    pub async fn spawn_sync_ticker(self: Arc<Self>, interval_minutes: u64) {
        let mut tick = interval(Duration::from_secs(interval_minutes.max(1) * 60));
        loop {
            tick.tick().await;
            self.run_guarded().await;
        }
    }

    /// Independent scheduler over the same `syncMarket` algorithm, at its
    /// own cadence (default 30m).
    pub async fn spawn_discovery_ticker(self: Arc<Self>, interval_minutes: u64) {
        let mut tick = interval(Duration::from_secs(interval_minutes.max(1) * 60));
        loop {
            tick.tick().await;
            self.run_guarded().await;
        }
    }

    async fn run_guarded(&self) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!("sync cycle already in progress, skipping this tick");
            return;
        }
        let written = self.run_cycle().await;
        info!(written, "sync cycle complete");
        self.in_progress.store(false, Ordering::SeqCst);
    }

    /// The 12-step algorithm. Returns the number of markets actually written.
    pub async fn run_cycle(&self) -> usize {
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Step 1: fresh-deployment detection.
        let existing_count = self.store.market_count().await;
        let force_mode = existing_count < FRESH_DEPLOYMENT_THRESHOLD;
        if force_mode {
            info!(existing_count, "fresh deployment detected, forcing full sync");
        }

        // Step 2: paginated discovery.
        let mut offset = 0usize;
        let mut empty_pages = 0u32;
        let mut seen_this_cycle: HashSet<String> = HashSet::new();
        let mut subscribe_tokens: Vec<String> = Vec::new();
        let mut written = 0usize;

        loop {
            let params = FetchMarketsParams {
                limit: PAGE_SIZE,
                offset,
                active: true,
                closed: false,
                tag_slug: None,
                tag_id: None,
            };
            let page = self.rest.fetch_markets(&params).await;
            if page.is_empty() {
                empty_pages += 1;
                if empty_pages >= MAX_EMPTY_PAGES {
                    break;
                }
                offset += PAGE_SIZE;
                continue;
            }
            empty_pages = 0;

            for market in &page {
                match self
                    .sync_one_market(market, force_mode, now_ms, &mut seen_this_cycle)
                    .await
                {
                    Ok(Some(token_ids)) => {
                        written += 1;
                        subscribe_tokens.extend(token_ids);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("market sync error, skipping market: {e}");
                    }
                }
            }

            if seen_this_cycle.len() >= MAX_MARKETS_PER_CYCLE {
                break;
            }

            offset += PAGE_SIZE;
        }

        // Step 11: new-market detection ran inline per-market (step 10 runs
        // new-outcome detection per market too); nothing further to do here.

        // Step 12: hand off collected token ids, capped.
        subscribe_tokens.truncate(MAX_SUBSCRIBE_BATCH);
        if !subscribe_tokens.is_empty() {
            if let Err(e) = self.control_tx.send(ControlMsg::Subscribe(subscribe_tokens)).await {
                warn!("failed to hand off new token ids to stream client: {e}");
            }
        }

        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        if cycle % PRUNE_EVERY_N_CYCLES == 0 {
            match self.store.prune_price_history(self.retention_days).await {
                Ok(n) => info!(rows = n, "pruned price history"),
                Err(e) => warn!("price history prune failed: {e}"),
            }
        }

        written
    }

    /// Steps 3-10 for a single market. Returns `Ok(Some(token_ids))` when the
    /// market was written (new or changed), `Ok(None)` when skipped.
    async fn sync_one_market(
        &self,
        market: &NormalizedMarket,
        force_mode: bool,
        now_ms: i64,
        seen_this_cycle: &mut HashSet<String>,
    ) -> crate::error::Result<Option<Vec<String>>> {
        // Step 3: canonical id.
        let Some(canonical_id) = market.canonical_id().map(|s| s.to_string()) else {
            return Ok(None);
        };
        if !seen_this_cycle.insert(canonical_id.clone()) {
            return Ok(None);
        }

        // Step 4: parent/child suppression.
        let question_id = match &market.question_id {
            Some(qid) => Some(qid.clone()),
            None => {
                if let Some(condition_id) = &market.condition_id {
                    tokio::time::timeout(
                        Duration::from_secs(QUESTION_ID_LOOKUP_TIMEOUT_SECS),
                        self.rest.fetch_question_id(condition_id),
                    )
                    .await
                    .ok()
                    .flatten()
                } else {
                    None
                }
            }
        };
        if let Some(qid) = &question_id {
            if qid != &canonical_id && self.store.market_exists(qid).await {
                return Ok(None);
            }
        }

        // Step 5: category detection.
        let category = detect_category(market);

        // Step 6: change detection (skipped in force mode).
        if !force_mode {
            if let Some(existing) = self.store.market_change_fields(&canonical_id).await {
                let unchanged = existing.question == market.question
                    && existing.slug == market.slug
                    && existing.category.as_deref() == Some(category.as_str())
                    && existing.end_date == market.end_date
                    && existing.image_url == market.image;
                if unchanged {
                    return Ok(None);
                }
            }
        }

        // Step 7: upsert market.
        let record = Market {
            id: canonical_id.clone(),
            question: market.question.clone(),
            slug: market.slug.clone(),
            category: category.clone(),
            end_date: market.end_date,
            image_url: market.image.clone(),
            volume: market.volume,
            volume_24h: market.volume_24h,
            liquidity: market.liquidity,
            question_id: question_id.clone(),
        };
        self.store.upsert_market(&record).await?;

        // Step 7 (cont'd): derive outcomes.
        let derived = self.derive_outcomes(market, &canonical_id).await;

        let mut token_ids = Vec::new();
        let mut outcome_refs = Vec::new();
        for outcome in &derived {
            self.store.upsert_outcome(outcome).await?;
            self.token_index
                .insert(outcome.token_id.clone(), canonical_id.clone(), outcome.id.clone());
            token_ids.push(outcome.token_id.clone());
            outcome_refs.push((outcome.id.clone(), outcome.name.clone()));

            // Step 9: synthetic initial price event.
            let initial_mid = synthetic_initial_mid(market, &derived, &outcome.name);
            self.emit_synthetic_price(&canonical_id, &outcome.id, initial_mid, now_ms).await;
        }

        // Step 10: new-outcome detection.
        let new_outcome_alerts = new_entity::check_new_outcomes(
            &self.cache,
            &canonical_id,
            &outcome_refs,
            &market.question,
            &category,
            &market.tags,
            now_ms,
        )
        .await;
        for a in &new_outcome_alerts {
            alert::enqueue(&self.cache, a).await;
        }

        // Step 11 (per-market half): new-market detection.
        if let Some(a) = new_entity::check_new_market(
            &self.cache,
            &canonical_id,
            &market.question,
            &category,
            &market.tags,
            now_ms,
        )
        .await
        {
            alert::enqueue(&self.cache, &a).await;
        }

        Ok(Some(token_ids))
    }

    async fn derive_outcomes(&self, market: &NormalizedMarket, market_id: &str) -> Vec<Outcome> {
        if let Some(outcomes) = outcomes_with_tokens(market) {
            return outcomes
                .into_iter()
                .map(|(token_id, name, volume, volume_24h)| Outcome {
                    id: format!("{market_id}:{token_id}"),
                    market_id: market_id.to_string(),
                    name,
                    token_id,
                    volume,
                    volume_24h,
                })
                .collect();
        }

        if !market.sub_markets.is_empty() {
            return market
                .sub_markets
                .iter()
                .filter_map(|sm| {
                    let token_id = sm.token_id.clone()?;
                    Some(Outcome {
                        id: format!("{market_id}:{token_id}"),
                        market_id: market_id.to_string(),
                        name: sm.name.clone(),
                        token_id,
                        volume: sm.volume,
                        volume_24h: sm.volume_24h,
                    })
                })
                .collect();
        }

        let fetched = self.rest.fetch_market_tokens(market_id).await;
        if !fetched.is_empty() {
            return fetched
                .into_iter()
                .map(|(token_id, name)| Outcome {
                    id: format!("{market_id}:{token_id}"),
                    market_id: market_id.to_string(),
                    name,
                    token_id,
                    volume: 0.0,
                    volume_24h: 0.0,
                })
                .collect();
        }

        if market.condition_id.is_some() {
            let placeholder = market_id.to_string();
            return vec![
                Outcome {
                    id: format!("{market_id}:yes"),
                    market_id: market_id.to_string(),
                    name: "Yes".to_string(),
                    token_id: placeholder.clone(),
                    volume: 0.0,
                    volume_24h: 0.0,
                },
                Outcome {
                    id: format!("{market_id}:no"),
                    market_id: market_id.to_string(),
                    name: "No".to_string(),
                    token_id: placeholder,
                    volume: 0.0,
                    volume_24h: 0.0,
                },
            ];
        }

        Vec::new()
    }

    async fn emit_synthetic_price(&self, market_id: &str, outcome_id: &str, mid: f64, now_ms: i64) {
        let bid = (mid * 0.99).clamp(0.0, 1.0);
        let ask = (mid * 1.01).clamp(0.0, 1.0);
        let row = PriceHistoryRow::new(bid, ask, now_ms);

        self.cache
            .setex(&format!("last_price:{market_id}:{outcome_id}"), &format!("{now_ms}:{}", row.mid), config::anomaly::PRICE_VELOCITY_TTL_SECS as u64)
            .await;

        if let Err(e) = self.store.insert_price_history(market_id, outcome_id, &row).await {
            warn!("failed to persist synthetic initial price: {e}");
        }
    }
}

/// `outcomes[]` with `tokenId` present, preferred over sub-markets/fetched
/// tokens/synthetic binary.
fn outcomes_with_tokens(market: &NormalizedMarket) -> Option<Vec<(String, String, f64, f64)>> {
    if market.outcomes.is_empty() {
        return None;
    }
    let with_tokens: Vec<_> = market
        .outcomes
        .iter()
        .filter_map(|o| o.token_id.clone().map(|t| (t, o.name.clone(), o.volume, o.volume_24h)))
        .collect();
    if with_tokens.is_empty() {
        None
    } else {
        Some(with_tokens)
    }
}

/// For buckets, `1/N` across derived outcomes; for binary, 0.5.
fn synthetic_initial_mid(market: &NormalizedMarket, derived: &[Outcome], outcome_name: &str) -> f64 {
    if !market.sub_markets.is_empty() {
        let n = derived.len().max(1) as f64;
        return 1.0 / n;
    }
    let _ = outcome_name;
    0.5
}

/// tags → category field → keyword scan of question; fallback: first tag,
/// else "All".
fn detect_category(market: &NormalizedMarket) -> Category {
    for tag in &market.tags {
        let t = tag.to_lowercase();
        if ["crypto", "bitcoin", "ethereum"].iter().any(|kw| t.contains(kw)) {
            return Category::Crypto;
        }
        if ["politics", "election"].iter().any(|kw| t.contains(kw)) {
            return Category::Politics;
        }
        if ["sports", "nba", "nfl"].iter().any(|kw| t.contains(kw)) {
            return Category::Sports;
        }
    }

    if let Some(cat) = &market.category {
        let c = cat.to_lowercase();
        if c.contains("crypto") {
            return Category::Crypto;
        }
        if c.contains("politic") {
            return Category::Politics;
        }
        if c.contains("sport") {
            return Category::Sports;
        }
        if c.contains("entertain") {
            return parse_category("Entertainment");
        }
    }

    let q = market.question.to_lowercase();
    if ["crypto", "bitcoin", "ethereum"].iter().any(|kw| q.contains(kw)) {
        return Category::Crypto;
    }
    if ["politics", "election"].iter().any(|kw| q.contains(kw)) {
        return Category::Politics;
    }
    if ["sports", "nba", "nfl"].iter().any(|kw| q.contains(kw)) {
        return Category::Sports;
    }

    if let Some(first_tag) = market.tags.first() {
        return parse_category(first_tag);
    }
    Category::Other("All".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::rest::{NormalizedOutcome, SubMarket};

    fn sample_market() -> NormalizedMarket {
        NormalizedMarket {
            condition_id: Some("0xabc".to_string()),
            question_id: None,
            raw_id: None,
            question: "Will BTC hit 100k?".to_string(),
            slug: "btc-100k".to_string(),
            image: None,
            end_date: None,
            category: None,
            tags: vec![],
            liquidity: 0.0,
            volume: 0.0,
            volume_24h: 0.0,
            outcomes: vec![],
            sub_markets: vec![],
        }
    }

    #[test]
    fn detects_crypto_from_question_keyword() {
        let m = sample_market();
        assert_eq!(detect_category(&m), Category::Crypto);
    }

    #[test]
    fn detects_crypto_from_tags_first() {
        let mut m = sample_market();
        m.question = "Will it happen?".to_string();
        m.tags = vec!["Bitcoin".to_string()];
        assert_eq!(detect_category(&m), Category::Crypto);
    }

    #[test]
    fn falls_back_to_all_with_no_signal() {
        let mut m = sample_market();
        m.question = "Will it happen?".to_string();
        assert_eq!(detect_category(&m), Category::Other("All".to_string()));
    }

    #[test]
    fn outcomes_with_tokens_prefers_tagged_outcomes() {
        let mut m = sample_market();
        m.outcomes = vec![
            NormalizedOutcome {
                token_id: Some("tok-yes".to_string()),
                name: "Yes".to_string(),
                volume: 1.0,
                volume_24h: 2.0,
            },
            NormalizedOutcome {
                token_id: Some("tok-no".to_string()),
                name: "No".to_string(),
                volume: 3.0,
                volume_24h: 4.0,
            },
        ];
        let result = outcomes_with_tokens(&m).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0, "tok-yes");
    }

    #[test]
    fn synthetic_mid_is_even_split_for_buckets() {
        let mut m = sample_market();
        m.sub_markets = vec![SubMarket::default(), SubMarket::default(), SubMarket::default()];
        let derived = vec![
            Outcome {
                id: "a".into(),
                market_id: "m".into(),
                name: "a".into(),
                token_id: "ta".into(),
                volume: 0.0,
                volume_24h: 0.0,
            },
            Outcome {
                id: "b".into(),
                market_id: "m".into(),
                name: "b".into(),
                token_id: "tb".into(),
                volume: 0.0,
                volume_24h: 0.0,
            },
            Outcome {
                id: "c".into(),
                market_id: "m".into(),
                name: "c".into(),
                token_id: "tc".into(),
                volume: 0.0,
                volume_24h: 0.0,
            },
        ];
        let mid = synthetic_initial_mid(&m, &derived, "a");
        assert!((mid - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn synthetic_mid_is_half_for_binary() {
        let m = sample_market();
        let mid = synthetic_initial_mid(&m, &[], "Yes");
        assert!((mid - 0.5).abs() < 1e-9);
    }
}
