//! FleetBot - Multi-Account Prediction Market Trading Fleet
//!
//! Boots the orchestration core from configuration: one agent task per
//! account, the risk governor and kill switch, the snapshot publisher and
//! rebalancer, and the HTTP/WebSocket observer surface.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetbot_backend::{
    api::{create_router, AppState},
    config::{AppConfig, Cli},
    execution::{ExecutionVenue, PaperVenue, PaperVenueConfig},
    fleet::{
        account::{AccountRegistry, AccountShared},
        aggregator::StateAggregator,
        governor::RiskGovernor,
        logbuf::LogBuffer,
        orchestrator::Orchestrator,
        publisher::StreamPublisher,
        rebalancer::RebalancingEngine,
    },
    market::{MarketData, SimMarketConfig, SimulatedMarketData},
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!(
        accounts = config.accounts.len(),
        total_capital = config.total_capital(),
        "fleet configuration loaded"
    );

    let accounts: Vec<_> = config
        .accounts
        .iter()
        .map(|a| AccountShared::new(a.id.clone(), a.strategy, a.capital_usd, a.limits.clone()))
        .collect();
    let registry = Arc::new(AccountRegistry::new(accounts));
    let logs = Arc::new(LogBuffer::default());
    let governor = Arc::new(RiskGovernor::new(
        registry.clone(),
        config.portfolio.clone(),
        logs.clone(),
    ));

    // Offline collaborators: simulated market data and a paper venue. Real
    // connectivity plugs in behind the same traits.
    let market: Arc<dyn MarketData> = Arc::new(SimulatedMarketData::new(SimMarketConfig::default()));
    let venue: Arc<dyn ExecutionVenue> = Arc::new(PaperVenue::new(PaperVenueConfig::from_env()));

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        governor.clone(),
        logs.clone(),
        market,
        venue,
        Duration::from_millis(config.tick_interval_ms),
    ));
    let aggregator = Arc::new(StateAggregator::new(
        registry.clone(),
        governor.clone(),
        logs.clone(),
    ));
    let publisher = Arc::new(StreamPublisher::new(
        aggregator.clone(),
        config.stream_capacity,
        Duration::from_millis(config.publish_interval_ms),
    ));
    let rebalancer = Arc::new(RebalancingEngine::new(
        registry.clone(),
        logs.clone(),
        config.portfolio.daily_profit_target_usd,
        config.rebalance.clone(),
    ));

    tokio::spawn(publisher.clone().run());
    tokio::spawn(rebalancer.run());

    if config.auto_start {
        let outcome = orchestrator.start_all().await;
        if !outcome.success {
            warn!(reason = %outcome.reason, "some accounts failed to start");
        }
    }

    let state = AppState {
        orchestrator: orchestrator.clone(),
        aggregator,
        publisher,
    };
    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "fleet API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown signal received; stopping fleet");
    orchestrator.kill_switch().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
