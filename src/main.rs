// =============================================================================
// Trading Coordinator — Main Entry Point
// =============================================================================
//
// Collaborators are wired in the order §4.1 requires: EventSink → MarketData
// → ExchangeClient → RiskManager → EnsembleAggregator. Any initialization
// failure here is fatal; the process exits before entering the heartbeat
// loop.
// =============================================================================

mod api;
mod broadcast;
mod clock;
mod config;
mod coordinator;
mod ensemble;
mod error;
mod events;
mod events_csv;
mod events_sql;
mod exchange;
mod market_data;
mod model;
mod risk;
mod status;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use broadcast::ChannelBroadcastSink;
use clock::SystemClock;
use config::AppConfig;
use coordinator::Coordinator;
use ensemble::EnsembleAggregator;
use events::{CompositeEventSink, EventSink, NullEventSink};
use events_csv::CsvEventSink;
use events_sql::SqlEventSink;
use exchange::ExchangeClient;
use market_data::HttpMarketData;
use risk::RiskManager;

const BROADCAST_CAPACITY: usize = 256;
const DASHBOARD_BIND_ADDR: &str = "0.0.0.0:8090";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("trading coordinator starting up");

    let config = match AppConfig::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let clock = Arc::new(SystemClock);

    // ── EventSink ─────────────────────────────────────────────────────────
    let events: Arc<dyn EventSink> = match build_event_sink(&config).await {
        Ok(sink) => sink,
        Err(e) => {
            error!(error = %e, "failed to initialize event sink");
            std::process::exit(1);
        }
    };

    // ── MarketData ────────────────────────────────────────────────────────
    let market_data = Arc::new(HttpMarketData::new(config.testnet));

    // ── ExchangeClient ────────────────────────────────────────────────────
    let exchange = match ExchangeClient::new(&config, clock.as_ref()).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to initialize exchange client");
            std::process::exit(1);
        }
    };

    // ── RiskManager ───────────────────────────────────────────────────────
    let risk = Arc::new(RiskManager::new(config.trading.clone(), config.safety.clone(), clock.now()));

    // ── EnsembleAggregator ────────────────────────────────────────────────
    let model_timeout = std::time::Duration::from_secs(config.timing.model_timeout_secs);
    let ensemble = Arc::new(EnsembleAggregator::new(&config.ensemble, config.model_endpoints.clone(), model_timeout));

    let broadcast = Arc::new(ChannelBroadcastSink::new(BROADCAST_CAPACITY));

    let coordinator = Coordinator::new(config, clock, exchange, risk, ensemble, market_data, events, broadcast);

    let running = coordinator.clone();
    let run_handle = tokio::spawn(async move { running.run(DASHBOARD_BIND_ADDR).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    coordinator.stop().await;

    if let Err(e) = run_handle.await? {
        error!(error = %e, "coordinator exited with error");
        std::process::exit(1);
    }

    Ok(())
}

async fn build_event_sink(config: &AppConfig) -> anyhow::Result<Arc<dyn EventSink>> {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();

    if !config.database.sqlite_path.is_empty() {
        sinks.push(Box::new(SqlEventSink::connect(&config.database.sqlite_path).await?));
    }
    if !config.database.csv_path.is_empty() {
        sinks.push(Box::new(CsvEventSink::new(&config.database.csv_path)?));
    }

    if sinks.is_empty() {
        return Ok(Arc::new(NullEventSink));
    }
    Ok(Arc::new(CompositeEventSink::new(sinks)))
}
