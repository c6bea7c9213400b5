//! Venue REST client (4.E): paginated fetch, single-fetch, token-list fetch,
//! retry/endpoint-fallback. All calls are idempotent and side-effect-free;
//! failure returns an empty result, never propagates across the boundary
//! (§7: `NETWORK_TIMEOUT`/`REMOTE_SHAPE_MISMATCH` → caller sees empty result).

use std::time::Duration;

use tracing::{debug, warn};

const FETCH_TIMEOUT_SECS: u64 = 10;
const QUESTION_ID_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Clone, Default)]
pub struct NormalizedOutcome {
    pub token_id: Option<String>,
    pub name: String,
    pub volume: f64,
    pub volume_24h: f64,
}

/// A bucket event's sub-market (multi-outcome range market).
#[derive(Debug, Clone, Default)]
pub struct SubMarket {
    pub name: String,
    pub token_id: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedMarket {
    pub condition_id: Option<String>,
    pub question_id: Option<String>,
    pub raw_id: Option<String>,
    pub question: String,
    pub slug: String,
    pub image: Option<String>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub liquidity: f64,
    pub volume: f64,
    pub volume_24h: f64,
    pub outcomes: Vec<NormalizedOutcome>,
    pub sub_markets: Vec<SubMarket>,
}

impl NormalizedMarket {
    /// `conditionId ?? questionId ?? id ?? tokenId` (4.G step 3).
    pub fn canonical_id(&self) -> Option<&str> {
        self.condition_id
            .as_deref()
            .or(self.question_id.as_deref())
            .or(self.raw_id.as_deref())
            .or_else(|| self.outcomes.first().and_then(|o| o.token_id.as_deref()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tag {
    pub id: String,
    pub label: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchMarketsParams {
    pub limit: usize,
    pub offset: usize,
    pub active: bool,
    pub closed: bool,
    pub tag_slug: Option<String>,
    pub tag_id: Option<String>,
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    gamma_api_url: String,
    clob_api_url: String,
}

impl RestClient {
    pub fn new(gamma_api_url: String, clob_api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            gamma_api_url,
            clob_api_url,
        }
    }

    /// Tries each endpoint in order; the first non-empty success wins. The
    /// fallback loop is an explicit fold over attempts, not exception-driven
    /// control flow (9. DESIGN NOTES).
    pub async fn fetch_markets(&self, params: &FetchMarketsParams) -> Vec<NormalizedMarket> {
        let endpoints = [
            format!("{}/markets", self.gamma_api_url),
            format!("{}/public-markets", self.gamma_api_url),
        ];

        for url in &endpoints {
            match self.fetch_markets_from(url, params).await {
                Ok(list) if !list.is_empty() => return list,
                Ok(_) => continue,
                Err(FetchError::NotFound) => continue,
                Err(FetchError::Other(msg)) => {
                    warn!(url, "market fetch attempt failed: {msg}");
                    continue;
                }
            }
        }
        Vec::new()
    }

    async fn fetch_markets_from(
        &self,
        url: &str,
        params: &FetchMarketsParams,
    ) -> std::result::Result<Vec<NormalizedMarket>, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(&[
                ("limit", params.limit.to_string()),
                ("offset", params.offset.to_string()),
                ("active", params.active.to_string()),
                ("closed", params.closed.to_string()),
            ])
            .query(&params.tag_slug.as_ref().map(|s| ("tag_slug", s.clone())))
            .query(&params.tag_id.as_ref().map(|s| ("tag_id", s.clone())))
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(FetchError::Other(format!("status {}", resp.status())));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| FetchError::Other(e.to_string()))?;
        Ok(extract_items(&body).iter().filter_map(normalize_market).collect())
    }

    pub async fn fetch_market(&self, id_or_slug: &str) -> Option<NormalizedMarket> {
        let url = format!("{}/markets/{}", self.gamma_api_url, id_or_slug);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        normalize_market(&body)
    }

    pub async fn fetch_question_id(&self, condition_id: &str) -> Option<String> {
        let url = format!("{}/markets/{}", self.gamma_api_url, condition_id);
        let resp = tokio::time::timeout(
            Duration::from_secs(QUESTION_ID_TIMEOUT_SECS),
            self.client.get(&url).send(),
        )
        .await
        .ok()?
        .ok()?;
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("questionId")
            .or_else(|| body.get("question_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Ordered `[{tokenId, outcomeName}]`, from `tokens|outcomes`, else from
    /// nested sub-markets (bucket events).
    pub async fn fetch_market_tokens(&self, id: &str) -> Vec<(String, String)> {
        let Some(market) = self.fetch_market(id).await else {
            return Vec::new();
        };
        if !market.outcomes.is_empty() {
            return market
                .outcomes
                .into_iter()
                .filter_map(|o| o.token_id.map(|t| (t, o.name)))
                .collect();
        }
        market
            .sub_markets
            .into_iter()
            .filter_map(|s| s.token_id.map(|t| (t, s.name)))
            .collect()
    }

    pub async fn fetch_tags(&self) -> Vec<Tag> {
        let url = format!("{}/tags", self.gamma_api_url);
        let Ok(resp) = self.client.get(&url).send().await else {
            return Vec::new();
        };
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return Vec::new();
        };
        extract_items(&body)
            .iter()
            .filter_map(|v| {
                Some(Tag {
                    id: as_string(v.get("id"))?,
                    label: v.get("label").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                    slug: v.get("slug").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                })
            })
            .collect()
    }
}

enum FetchError {
    NotFound,
    Other(String),
}

impl FetchError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Other(format!("timeout: {e}"))
        } else {
            FetchError::Other(e.to_string())
        }
    }
}

/// Accepts `{data|markets|events}` or bare arrays.
fn extract_items(body: &serde_json::Value) -> Vec<serde_json::Value> {
    if let Some(arr) = body.as_array() {
        return arr.clone();
    }
    for key in ["data", "markets", "events"] {
        if let Some(arr) = body.get(key).and_then(|v| v.as_array()) {
            return arr.clone();
        }
    }
    Vec::new()
}

fn as_string(v: Option<&serde_json::Value>) -> Option<String> {
    let v = v?;
    v.as_str().map(|s| s.to_string()).or_else(|| v.as_i64().map(|n| n.to_string()))
}

fn as_f64_tolerant(v: Option<&serde_json::Value>) -> f64 {
    v.and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0.0)
}

fn parse_end_date(v: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
    for key in ["endDate", "endDateIso", "end_date_iso", "end_date"] {
        if let Some(s) = v.get(key).and_then(|x| x.as_str()) {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&chrono::Utc));
            }
        }
    }
    None
}

/// Tolerant decoder: tolerates snake_case/camelCase, string-typed numbers,
/// and missing fields (9. DESIGN NOTES — "replace ad-hoc normalization with
/// a single canonical market record populated by a tolerant decoder").
fn normalize_market(v: &serde_json::Value) -> Option<NormalizedMarket> {
    let question = v.get("question").and_then(|x| x.as_str()).unwrap_or("").to_string();
    let slug = v.get("slug").and_then(|x| x.as_str()).unwrap_or("").to_string();

    let condition_id = v.get("conditionId").or_else(|| v.get("condition_id")).and_then(|x| x.as_str()).map(String::from);
    let question_id = v.get("questionId").or_else(|| v.get("question_id")).and_then(|x| x.as_str()).map(String::from);
    let raw_id = v.get("id").and_then(as_string_val);

    let image = v.get("image").or_else(|| v.get("imageUrl")).and_then(|x| x.as_str()).map(String::from);
    let end_date = parse_end_date(v);

    let category = v.get("category").and_then(|x| x.as_str()).map(String::from);
    let tags = v
        .get("tags")
        .and_then(|x| x.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.as_str()
                        .map(String::from)
                        .or_else(|| t.get("label").and_then(|l| l.as_str()).map(String::from))
                        .or_else(|| t.get("slug").and_then(|l| l.as_str()).map(String::from))
                })
                .collect()
        })
        .unwrap_or_default();

    let liquidity = as_f64_tolerant(v.get("liquidity").or_else(|| v.get("liquidityNum")));
    let volume = as_f64_tolerant(v.get("volume").or_else(|| v.get("volumeNum")));
    let volume_24h = as_f64_tolerant(v.get("volume24hr").or_else(|| v.get("volume24h")));

    let outcomes = extract_outcomes(v);
    let sub_markets = extract_sub_markets(v, &question);

    Some(NormalizedMarket {
        condition_id,
        question_id,
        raw_id,
        question,
        slug,
        image,
        end_date,
        category,
        tags,
        liquidity,
        volume,
        volume_24h,
        outcomes,
        sub_markets,
    })
}

fn as_string_val(v: &serde_json::Value) -> Option<String> {
    v.as_str().map(String::from).or_else(|| v.as_i64().map(|n| n.to_string()))
}

fn extract_outcomes(v: &serde_json::Value) -> Vec<NormalizedOutcome> {
    let names: Vec<String> = v
        .get("outcomes")
        .and_then(|o| {
            o.as_array()
                .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .or_else(|| o.as_str().and_then(|s| serde_json::from_str::<Vec<String>>(s).ok()))
        })
        .unwrap_or_default();

    let token_ids: Vec<String> = v
        .get("tokens")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.get("token_id").or_else(|| t.get("tokenId")).and_then(as_string_val))
                .collect()
        })
        .or_else(|| {
            v.get("clobTokenIds").and_then(|c| {
                c.as_array()
                    .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                    .or_else(|| c.as_str().and_then(|s| serde_json::from_str(s).ok()))
            })
        })
        .unwrap_or_default();

    if names.is_empty() {
        return Vec::new();
    }

    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| NormalizedOutcome {
            token_id: token_ids.get(i).cloned(),
            name,
            volume: 0.0,
            volume_24h: 0.0,
        })
        .collect()
}

/// Bucket events carry nested sub-markets, each a binary Yes/No range.
fn extract_sub_markets(v: &serde_json::Value, parent_question: &str) -> Vec<SubMarket> {
    let Some(arr) = v.get("markets").and_then(|m| m.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|sm| {
            let raw_name = sm
                .get("groupItemTitle")
                .or_else(|| sm.get("question"))
                .or_else(|| sm.get("title"))
                .and_then(|x| x.as_str())?;
            let name = raw_name.strip_prefix(parent_question).unwrap_or(raw_name).trim().to_string();
            let token_id = sm
                .get("clobTokenIds")
                .and_then(|c| {
                    c.as_array()
                        .map(|a| a.first().cloned())
                        .or_else(|| c.as_str().and_then(|s| serde_json::from_str::<Vec<String>>(s).ok().map(|v| v.into_iter().next())))
                })
                .flatten()
                .and_then(|x| x.as_str().map(String::from).or(Some(x.to_string())));

            Some(SubMarket {
                name,
                token_id,
                volume: as_f64_tolerant(sm.get("volumeNum")),
                volume_24h: as_f64_tolerant(sm.get("volume24hr")),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_binary_market_with_string_arrays() {
        let v = serde_json::json!({
            "conditionId": "0xabc",
            "question": "Will it rain?",
            "slug": "will-it-rain",
            "outcomes": "[\"Yes\",\"No\"]",
            "clobTokenIds": "[\"tok-yes\",\"tok-no\"]",
            "volume24hr": "1500.5",
        });
        let m = normalize_market(&v).unwrap();
        assert_eq!(m.canonical_id(), Some("0xabc"));
        assert_eq!(m.outcomes.len(), 2);
        assert_eq!(m.outcomes[0].token_id.as_deref(), Some("tok-yes"));
        assert!((m.volume_24h - 1500.5).abs() < 1e-9);
    }

    #[test]
    fn canonical_id_falls_back_through_chain() {
        let v = serde_json::json!({"id": "999", "question": "x", "slug": "x"});
        let m = normalize_market(&v).unwrap();
        assert_eq!(m.canonical_id(), Some("999"));
    }

    #[test]
    fn extract_items_accepts_bare_array_and_wrapped_shapes() {
        let bare = serde_json::json!([{"a":1}]);
        assert_eq!(extract_items(&bare).len(), 1);
        let wrapped = serde_json::json!({"data": [{"a":1},{"a":2}]});
        assert_eq!(extract_items(&wrapped).len(), 2);
        let empty = serde_json::json!({"unexpected": true});
        assert!(extract_items(&empty).is_empty());
    }
}
