//! New-entity detector (4.J): tracks known market/outcome ids in cache sets
//! and yields alerts the first time an id is seen.

use crate::cache::Cache;
use crate::config::new_entity::{KNOWN_SET_TTL_SECS, SEVERITY_KEYWORDS};
use crate::types::{Alert, AlertPayload, Category, Severity};

const KNOWN_MARKETS_KEY: &str = "known_markets";

fn known_outcomes_key(market_id: &str) -> String {
    format!("known_outcomes:{market_id}")
}

/// `high` if question/category/tags contain a keyword from the fixed list,
/// else `medium`.
fn severity_for(question: &str, category: &Category, tags: &[String]) -> Severity {
    let haystack = format!("{} {} {}", question, category.as_str(), tags.join(" ")).to_lowercase();
    if SEVERITY_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Returns `Some(alert)` the first time `canonical_id` is observed; adds it
/// to the known set (30d TTL) either way so repeats are silent.
pub async fn check_new_market(
    cache: &Cache,
    canonical_id: &str,
    question: &str,
    category: &Category,
    tags: &[String],
    ts_ms: i64,
) -> Option<Alert> {
    let already_known = cache.s_is_member(KNOWN_MARKETS_KEY, canonical_id).await;
    cache.s_add(KNOWN_MARKETS_KEY, canonical_id).await;
    cache.expire(KNOWN_MARKETS_KEY, KNOWN_SET_TTL_SECS).await;

    if already_known {
        return None;
    }

    let severity = severity_for(question, category, tags);
    Some(Alert {
        severity,
        market_id: canonical_id.to_string(),
        outcome_id: None,
        token_id: None,
        outcome_name: None,
        message: format!("New market: {question}"),
        payload: AlertPayload::NewMarket {
            question: question.to_string(),
        },
        timestamp_ms: ts_ms,
        extras: Default::default(),
    })
}

/// Compares `outcome_ids` against `known_outcomes:<marketId>`; new ids yield
/// alerts and are added to the set.
pub async fn check_new_outcomes(
    cache: &Cache,
    market_id: &str,
    outcome_ids: &[(String, String)],
    question: &str,
    category: &Category,
    tags: &[String],
    ts_ms: i64,
) -> Vec<Alert> {
    let key = known_outcomes_key(market_id);
    let severity = severity_for(question, category, tags);
    let mut alerts = Vec::new();

    for (outcome_id, outcome_name) in outcome_ids {
        let already_known = cache.s_is_member(&key, outcome_id).await;
        cache.s_add(&key, outcome_id).await;
        if already_known {
            continue;
        }
        alerts.push(Alert {
            severity,
            market_id: market_id.to_string(),
            outcome_id: Some(outcome_id.clone()),
            token_id: None,
            outcome_name: Some(outcome_name.clone()),
            message: format!("New outcome on {market_id}: {outcome_name}"),
            payload: AlertPayload::NewOutcome {
                outcome_name: outcome_name.clone(),
            },
            timestamp_ms: ts_ms,
            extras: Default::default(),
        });
    }
    cache.expire(&key, KNOWN_SET_TTL_SECS).await;
    alerts
}

/// Seeds `known_markets` from persisted state on startup so a redeploy
/// doesn't re-announce every existing market.
pub async fn seed_known_markets(cache: &Cache, market_ids: &[String]) {
    for id in market_ids {
        cache.s_add(KNOWN_MARKETS_KEY, id).await;
    }
    cache.expire(KNOWN_MARKETS_KEY, KNOWN_SET_TTL_SECS).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_detects_keyword() {
        let cat = Category::Other("All".to_string());
        assert_eq!(severity_for("Will there be a war in 2027?", &cat, &[]), Severity::High);
        assert_eq!(severity_for("Will BTC hit 100k?", &cat, &[]), Severity::Medium);
    }

    #[test]
    fn severity_checks_tags_too() {
        let cat = Category::Other("All".to_string());
        let tags = vec!["election".to_string()];
        assert_eq!(severity_for("random question", &cat, &tags), Severity::High);
    }
}
