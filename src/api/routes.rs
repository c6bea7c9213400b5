//! Read API (Component O): thin `axum` projection over D (markets, outcomes,
//! price history) and the alert feed in C. No business logic lives here —
//! every handler is a direct store/cache read.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::api::health::HealthState;
use crate::cache::Cache;
use crate::db::store::Store;
use crate::error::AppError;
use crate::types::Alert;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub cache: Cache,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/markets", get(get_markets))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/outcomes", get(get_market_outcomes))
        .route("/markets/:id/prices", get(get_market_prices))
        .route("/markets/:id/alerts", get(get_market_alerts))
        .route("/alerts/recent", get(get_recent_alerts))
        .route("/health", get(get_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query params
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketsQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct PriceHistoryQuery {
    pub outcome_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct MarketResponse {
    pub id: String,
    pub question: String,
    pub slug: String,
    pub category: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
}

#[derive(Serialize)]
pub struct OutcomeResponse {
    pub id: String,
    pub name: String,
    pub token_id: String,
    pub volume: f64,
    pub volume_24h: f64,
    pub last_price: Option<f64>,
}

#[derive(Serialize)]
pub struct PriceHistoryResponse {
    pub outcome_id: String,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub implied_probability: f64,
    pub timestamp_ms: i64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub stream_connected: bool,
    pub last_sync_at_ms: i64,
    pub last_sync_written: u64,
    pub token_index_size: u64,
    pub active_market_count: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Result<Json<Vec<MarketResponse>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let rows = sqlx::query(
        "SELECT id, question, slug, category, volume::float8 AS volume,
                volume_24h::float8 AS volume_24h, liquidity::float8 AS liquidity
         FROM markets
         WHERE $1::text IS NULL OR category = $1
         ORDER BY updated_at DESC LIMIT $2",
    )
    .bind(&params.category)
    .bind(limit)
    .fetch_all(state.store.pool())
    .await?;

    let markets = rows
        .into_iter()
        .map(|r| MarketResponse {
            id: r.get("id"),
            question: r.get("question"),
            slug: r.get("slug"),
            category: r.try_get("category").ok(),
            volume: r.get("volume"),
            volume_24h: r.get("volume_24h"),
            liquidity: r.get("liquidity"),
        })
        .collect();

    Ok(Json(markets))
}

async fn get_market(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> Result<Json<Option<MarketResponse>>, AppError> {
    let row = sqlx::query(
        "SELECT id, question, slug, category, volume::float8 AS volume,
                volume_24h::float8 AS volume_24h, liquidity::float8 AS liquidity
         FROM markets WHERE id = $1",
    )
    .bind(&market_id)
    .fetch_optional(state.store.pool())
    .await?;

    Ok(Json(row.map(|r| MarketResponse {
        id: r.get("id"),
        question: r.get("question"),
        slug: r.get("slug"),
        category: r.try_get("category").ok(),
        volume: r.get("volume"),
        volume_24h: r.get("volume_24h"),
        liquidity: r.get("liquidity"),
    })))
}

async fn get_market_outcomes(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
) -> Result<Json<Vec<OutcomeResponse>>, AppError> {
    let rows = sqlx::query(
        "SELECT id, outcome, token_id, volume::float8 AS volume, volume_24h::float8 AS volume_24h
         FROM outcomes WHERE market_id = $1",
    )
    .bind(&market_id)
    .fetch_all(state.store.pool())
    .await?;

    let mut outcomes = Vec::with_capacity(rows.len());
    for r in rows {
        let id: String = r.get("id");
        let last_price = state
            .cache
            .h_get_all(&format!("market:{market_id}:prices"))
            .await
            .get(&id)
            .and_then(|v| v.parse::<f64>().ok());
        outcomes.push(OutcomeResponse {
            id,
            name: r.get("outcome"),
            token_id: r.get("token_id"),
            volume: r.get("volume"),
            volume_24h: r.get("volume_24h"),
            last_price,
        });
    }

    Ok(Json(outcomes))
}

async fn get_market_prices(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Query(params): Query<PriceHistoryQuery>,
) -> Result<Json<Vec<PriceHistoryResponse>>, AppError> {
    let limit = params.limit.unwrap_or(200).clamp(1, 5000);
    let rows = sqlx::query(
        "SELECT outcome_id, bid_price::float8 AS bid_price, ask_price::float8 AS ask_price,
                mid_price::float8 AS mid_price, implied_probability::float8 AS implied_probability,
                timestamp
         FROM price_history
         WHERE market_id = $1 AND ($2::text IS NULL OR outcome_id = $2)
         ORDER BY timestamp DESC LIMIT $3",
    )
    .bind(&market_id)
    .bind(&params.outcome_id)
    .bind(limit)
    .fetch_all(state.store.pool())
    .await?;

    let history = rows
        .into_iter()
        .map(|r| {
            let ts: chrono::DateTime<chrono::Utc> = r.get("timestamp");
            PriceHistoryResponse {
                outcome_id: r.get("outcome_id"),
                bid: r.get("bid_price"),
                ask: r.get("ask_price"),
                mid: r.get("mid_price"),
                implied_probability: r.get("implied_probability"),
                timestamp_ms: ts.timestamp_millis(),
            }
        })
        .collect();

    Ok(Json(history))
}

async fn get_market_alerts(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Query(params): Query<AlertsQuery>,
) -> Json<Vec<Alert>> {
    Json(recent_alerts(&state, &format!("alerts:market:{market_id}"), params.limit.unwrap_or(50)).await)
}

async fn get_recent_alerts(State(state): State<ApiState>, Query(params): Query<AlertsQuery>) -> Json<Vec<Alert>> {
    Json(recent_alerts(&state, "alerts:pending", params.limit.unwrap_or(50)).await)
}

async fn recent_alerts(state: &ApiState, key: &str, limit: usize) -> Vec<Alert> {
    state
        .cache
        .l_range(key, 0, limit.max(1) as isize - 1)
        .await
        .iter()
        .filter_map(|raw| serde_json::from_str::<Alert>(raw).ok())
        .collect()
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        stream_connected: state.health.stream_connected(),
        last_sync_at_ms: state.health.last_sync_at_ms(),
        last_sync_written: state.health.last_sync_written(),
        token_index_size: state.health.token_index_size(),
        active_market_count: state.health.active_market_count(),
    })
}
