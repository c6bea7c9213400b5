/// Database row types matching the schema in §6. Used by sqlx for
/// runtime-checked queries (no `query!`/`query_as!` macros — see DESIGN.md).

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MarketRow {
    pub id: String,
    pub question: String,
    pub slug: String,
    pub category: Option<String>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub image_url: Option<String>,
    pub volume: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub question_id: Option<String>,
    pub activity_score: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutcomeRow {
    pub id: String,
    pub market_id: String,
    pub outcome: String,
    pub token_id: String,
    pub volume: f64,
    pub volume_24h: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PriceHistoryRow {
    pub id: i64,
    pub market_id: String,
    pub outcome_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub bid_price: f64,
    pub ask_price: f64,
    pub mid_price: f64,
    pub implied_probability: f64,
}

/// Fields compared for change detection in 4.G step 6.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketChangeFields {
    pub question: String,
    pub slug: String,
    pub category: Option<String>,
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
    pub image_url: Option<String>,
}
