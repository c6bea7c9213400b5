//! Persistent store capability (4.D): upsert/select/delete for markets,
//! outcomes, and price history over Postgres. Queries are runtime-checked
//! (`sqlx::query`/`query_as`, not the `query!` macro — see DESIGN.md for why).

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, warn};

use crate::db::models::{MarketChangeFields, MarketRow};
use crate::error::Result;
use crate::types::{Category, Market, Outcome};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent; safe to re-run. "Already exists" conditions are avoided
    /// outright via `IF NOT EXISTS` rather than caught after the fact.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS markets (
                id              TEXT PRIMARY KEY,
                question        TEXT NOT NULL,
                slug            TEXT UNIQUE,
                category        VARCHAR(100),
                end_date        TIMESTAMPTZ,
                image_url       TEXT,
                volume          NUMERIC(20,8) DEFAULT 0,
                volume_24h      NUMERIC(20,8) DEFAULT 0,
                liquidity       NUMERIC(20,8) DEFAULT 0,
                question_id     VARCHAR(255),
                activity_score  NUMERIC(10,5) DEFAULT 0,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outcomes (
                id          TEXT PRIMARY KEY,
                market_id   TEXT NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
                outcome     VARCHAR(255) NOT NULL,
                token_id    TEXT NOT NULL,
                volume      NUMERIC(20,8) DEFAULT 0,
                volume_24h  NUMERIC(20,8) DEFAULT 0,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (market_id, outcome)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                id                   BIGSERIAL PRIMARY KEY,
                market_id            TEXT NOT NULL,
                outcome_id           TEXT NOT NULL,
                timestamp            TIMESTAMPTZ NOT NULL,
                bid_price            NUMERIC(10,8) NOT NULL,
                ask_price            NUMERIC(10,8) NOT NULL,
                mid_price            NUMERIC(10,8) NOT NULL,
                implied_probability  NUMERIC(5,2) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Additive, re-runnable migrations.
        sqlx::query("ALTER TABLE markets ADD COLUMN IF NOT EXISTS activity_score NUMERIC(10,5) DEFAULT 0")
            .execute(&self.pool)
            .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_markets_category ON markets(category)",
            "CREATE INDEX IF NOT EXISTS idx_markets_end_date ON markets(end_date)",
            "CREATE INDEX IF NOT EXISTS idx_markets_question_id ON markets(question_id)",
            "CREATE INDEX IF NOT EXISTS idx_outcomes_market_id ON outcomes(market_id)",
            "CREATE INDEX IF NOT EXISTS idx_price_history_market_id ON price_history(market_id)",
            "CREATE INDEX IF NOT EXISTS idx_price_history_timestamp ON price_history(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_price_history_market_ts ON price_history(market_id, timestamp DESC)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        info!("schema initialized");
        Ok(())
    }

    pub async fn market_count(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) AS c FROM markets")
            .fetch_one(&self.pool)
            .await
            .map(|row| row.get::<i64, _>("c"))
            .unwrap_or(0)
    }

    pub async fn market_exists(&self, id: &str) -> bool {
        sqlx::query("SELECT 1 FROM markets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .is_some()
    }

    pub async fn market_change_fields(&self, id: &str) -> Option<MarketChangeFields> {
        let row = sqlx::query(
            "SELECT question, slug, category, end_date, image_url FROM markets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .ok()??;

        Some(MarketChangeFields {
            question: row.get("question"),
            slug: row.try_get("slug").unwrap_or_default(),
            category: row.try_get("category").ok(),
            end_date: row.try_get("end_date").ok(),
            image_url: row.try_get("image_url").ok(),
        })
    }

    /// Upsert; only writes if the market doesn't yet exist, since the sync
    /// engine is responsible for deciding (via `market_change_fields`)
    /// whether an existing row needs updating at all (4.G step 6).
    pub async fn upsert_market(&self, market: &Market) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO markets (id, question, slug, category, end_date, image_url, volume, volume_24h, liquidity, question_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (id) DO UPDATE SET
                question = EXCLUDED.question,
                slug = EXCLUDED.slug,
                category = EXCLUDED.category,
                end_date = EXCLUDED.end_date,
                image_url = EXCLUDED.image_url,
                volume = EXCLUDED.volume,
                volume_24h = EXCLUDED.volume_24h,
                liquidity = EXCLUDED.liquidity,
                question_id = EXCLUDED.question_id,
                updated_at = now()
            "#,
        )
        .bind(&market.id)
        .bind(&market.question)
        .bind(&market.slug)
        .bind(market.category.as_str())
        .bind(market.end_date)
        .bind(&market.image_url)
        .bind(market.volume)
        .bind(market.volume_24h)
        .bind(market.liquidity)
        .bind(&market.question_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert, with (market_id, outcome) unique-constraint conflict resolved
    /// by updating the existing row's id and token id in place (4.G step 8,
    /// §7 `DUPLICATE_CONSTRAINT`).
    pub async fn upsert_outcome(&self, outcome: &Outcome) -> Result<()> {
        let primary = sqlx::query(
            r#"
            INSERT INTO outcomes (id, market_id, outcome, token_id, volume, volume_24h)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                outcome = EXCLUDED.outcome,
                token_id = EXCLUDED.token_id,
                volume = EXCLUDED.volume,
                volume_24h = EXCLUDED.volume_24h
            "#,
        )
        .bind(&outcome.id)
        .bind(&outcome.market_id)
        .bind(&outcome.name)
        .bind(&outcome.token_id)
        .bind(outcome.volume)
        .bind(outcome.volume_24h)
        .execute(&self.pool)
        .await;

        match primary {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                warn!(
                    market_id = %outcome.market_id,
                    outcome = %outcome.name,
                    "outcome (market_id, outcome) conflict — rewriting id/token_id in place"
                );
                sqlx::query(
                    r#"
                    UPDATE outcomes SET id = $1, token_id = $2, volume = $3, volume_24h = $4
                    WHERE market_id = $5 AND outcome = $6
                    "#,
                )
                .bind(&outcome.id)
                .bind(&outcome.token_id)
                .bind(outcome.volume)
                .bind(outcome.volume_24h)
                .bind(&outcome.market_id)
                .bind(&outcome.name)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn outcome_ids_for_market(&self, market_id: &str) -> Vec<String> {
        sqlx::query("SELECT id FROM outcomes WHERE market_id = $1")
            .bind(market_id)
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.iter().map(|r| r.get::<String, _>("id")).collect())
            .unwrap_or_default()
    }

    pub async fn outcome_name(&self, outcome_id: &str) -> Option<String> {
        sqlx::query("SELECT outcome FROM outcomes WHERE id = $1")
            .bind(outcome_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|r| r.get("outcome"))
    }

    pub async fn market_brief(&self, market_id: &str) -> Option<(String, Option<String>, String)> {
        sqlx::query("SELECT question, category, slug FROM markets WHERE id = $1")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|r| (r.get("question"), r.try_get("category").ok(), r.get("slug")))
    }

    pub async fn event_slug_by_question_id(&self, question_id: &str) -> Option<String> {
        sqlx::query("SELECT slug FROM markets WHERE id = $1")
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|r| r.get("slug"))
    }

    pub async fn insert_price_history(
        &self,
        market_id: &str,
        outcome_id: &str,
        row: &crate::types::PriceHistoryRow,
    ) -> Result<()> {
        let ts = chrono::DateTime::from_timestamp_millis(row.timestamp_ms)
            .unwrap_or_else(chrono::Utc::now);
        sqlx::query(
            r#"
            INSERT INTO price_history (market_id, outcome_id, timestamp, bid_price, ask_price, mid_price, implied_probability)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(market_id)
        .bind(outcome_id)
        .bind(ts)
        .bind(row.bid)
        .bind(row.ask)
        .bind(row.mid)
        .bind(row.implied_probability)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes rows older than `retention_days`. Returns the number removed.
    pub async fn prune_price_history(&self, retention_days: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM price_history WHERE timestamp < now() - ($1 || ' days')::interval")
            .bind(retention_days)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// `(token_id, market_id, outcome_id)` for every stored outcome — used
    /// to seed the in-memory token index on startup.
    pub async fn all_outcome_tokens(&self) -> Vec<(String, String, String)> {
        sqlx::query("SELECT token_id, market_id, id FROM outcomes")
            .fetch_all(&self.pool)
            .await
            .map(|rows| {
                rows.iter()
                    .map(|r| (r.get("token_id"), r.get("market_id"), r.get("id")))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn known_market_ids(&self) -> Vec<String> {
        sqlx::query("SELECT id FROM markets")
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.iter().map(|r| r.get::<String, _>("id")).collect())
            .unwrap_or_default()
    }

    pub async fn market_row(&self, id: &str) -> Option<MarketRow> {
        sqlx::query_as::<_, MarketRow>(
            r#"
            SELECT id, question, slug, category, end_date, image_url,
                   volume::float8 AS volume, volume_24h::float8 AS volume_24h,
                   liquidity::float8 AS liquidity, question_id,
                   activity_score::float8 AS activity_score, created_at, updated_at
            FROM markets WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
    }

    /// Second-tier outcome resolution on token-index miss (4.H step 3):
    /// looks up by token id alone since `(marketId, tokenId)` narrows to the
    /// same row once the token id is known to exist.
    pub async fn outcome_by_token(&self, token_id: &str) -> Option<(String, String)> {
        sqlx::query("SELECT market_id, id FROM outcomes WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|r| (r.get("market_id"), r.get("id")))
    }
}

pub fn parse_category(s: &str) -> Category {
    match s {
        "Crypto" => Category::Crypto,
        "Politics" => Category::Politics,
        "Sports" => Category::Sports,
        other => Category::Other(other.to_string()),
    }
}
