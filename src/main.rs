mod alert;
mod api;
mod app;
mod cache;
mod config;
mod db;
mod detect;
mod error;
mod ingest;
mod market_index;
mod rolling;
mod stats;
mod sync;
mod types;
mod venue;

use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::Config;
use crate::error::Result;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let app = App::bootstrap(cfg).await?;
    app.spawn_all().await
}
