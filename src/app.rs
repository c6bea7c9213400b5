//! Application shell (Component N): owns every long-lived capability and
//! wires the tasks from §5 together. Generalizes the teacher's flat `run()`
//! in `main.rs` into a constructor-injected struct so each task can be
//! exercised in isolation instead of relying on module-level init order.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::alert::channels::{BroadcastChannel, ChannelSet, EmailChannel, FormattedAlert, WebhookChannel};
use crate::alert::dispatcher::Dispatcher;
use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::cache::Cache;
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::store::Store;
use crate::error::Result;
use crate::ingest::Ingestion;
use crate::market_index::TokenIndex;
use crate::rolling::RollingStore;
use crate::sync::SyncEngine;
use crate::types::{ControlMsg, PriceUpdate, StreamEvent};
use crate::venue::{RestClient, StreamClient};

pub struct App {
    cfg: Config,
    store: Store,
    cache: Cache,
    rest: RestClient,
    token_index: TokenIndex,
    health: Arc<HealthState>,
}

impl App {
    pub async fn bootstrap(cfg: Config) -> Result<Self> {
        let store = Store::connect(&cfg.database_url).await?;
        store.init_schema().await?;
        let cache = Cache::connect(&cfg.redis_url).await?;
        let rest = RestClient::new(cfg.gamma_api_url.clone(), cfg.clob_api_url.clone());

        let token_index = TokenIndex::new();
        token_index.seed_from_store(&store).await;
        info!(seeded = token_index.len(), "token index seeded from store");

        Ok(Self {
            cfg,
            store,
            cache,
            rest,
            token_index,
            health: Arc::new(HealthState::new()),
        })
    }

    /// Spawns every task from §5 and serves the read API; returns once the
    /// API listener exits (normally only on a fatal bind error).
    pub async fn spawn_all(self) -> Result<()> {
        let (control_tx, control_rx) = mpsc::channel::<ControlMsg>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(CHANNEL_CAPACITY);
        let (price_broadcast_tx, _) = broadcast::channel::<PriceUpdate>(CHANNEL_CAPACITY);
        let (alert_broadcast_tx, _) = broadcast::channel::<FormattedAlert>(CHANNEL_CAPACITY);

        // --- Venue stream client (4.F) ---
        let (stream_client, stream_state) = StreamClient::new(self.cfg.stream_url.clone(), control_rx, event_tx);
        tokio::spawn(async move { stream_client.run().await });

        let health_poll = self.health.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3));
            loop {
                tick.tick().await;
                // ConnectionState::Subscribed == 4 (venue/stream.rs).
                health_poll.set_stream_connected(stream_state.load(Ordering::Relaxed) == 4);
            }
        });

        // --- Real-time ingestion (4.H) ---
        let rolling = RollingStore::new(self.cache.clone());
        let ingestion = Arc::new(Ingestion::new(
            self.store.clone(),
            self.cache.clone(),
            rolling,
            self.token_index.clone(),
            price_broadcast_tx.clone(),
        ));
        let ingestion_for_run = ingestion.clone();
        tokio::spawn(async move { ingestion_for_run.run(event_rx).await });

        let health_ingest = self.health.clone();
        let ingestion_for_health = ingestion.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                health_ingest.set_active_market_count(ingestion_for_health.active_market_count());
            }
        });

        // --- Market sync engine (4.G) ---
        let sync_engine = Arc::new(SyncEngine::new(
            self.store.clone(),
            self.cache.clone(),
            self.rest.clone(),
            control_tx.clone(),
            self.token_index.clone(),
            self.cfg.persistence_retention_days,
        ));

        let health_sync = self.health.clone();
        let token_index_for_health = self.token_index.clone();
        let sync_for_ticker = sync_engine.clone();
        let sync_interval = self.cfg.sync_interval_minutes;
        tokio::spawn(async move {
            // Run one cycle immediately so a fresh deployment doesn't wait a
            // full interval before the token index has anything in it.
            let written = sync_for_ticker.run_cycle().await;
            health_sync.record_sync_cycle(now_ms(), written);
            health_sync.set_token_index_size(token_index_for_health.len());
            sync_for_ticker.clone().spawn_sync_ticker(sync_interval).await;
        });

        let discovery_interval = self.cfg.discovery_interval_minutes;
        let sync_for_discovery = sync_engine.clone();
        tokio::spawn(async move { sync_for_discovery.spawn_discovery_ticker(discovery_interval).await });

        // --- Alert dispatcher (4.L) ---
        let webhook = WebhookChannel::new(
            self.cfg.webhook_url.clone(),
            self.cfg.webhook_secret.clone(),
            self.cfg.webhook_enabled,
            self.cfg.webhook_timeout_ms,
            self.cfg.webhook_retry_attempts,
        );
        let broadcast_channel = BroadcastChannel::new(alert_broadcast_tx, self.cfg.broadcast_alerts_enabled);
        let email = EmailChannel::new(self.cfg.email_enabled);
        let channels = ChannelSet { webhook, broadcast: broadcast_channel, email };

        let dispatcher = Arc::new(Dispatcher::new(
            self.cache.clone(),
            self.store.clone(),
            self.rest.clone(),
            channels,
            self.cfg.clone(),
        ));
        dispatcher.start().await;

        // --- Read API & health (Component O) ---
        let api_state = ApiState {
            store: self.store.clone(),
            cache: self.cache.clone(),
            health: self.health.clone(),
        };
        let app = router(api_state);
        let bind_addr = format!("0.0.0.0:{}", self.cfg.api_port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!("read API listening on {bind_addr}");

        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(e) = result {
                    error!("API server exited: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining in-flight work");
                dispatcher.stop();
            }
        }

        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
