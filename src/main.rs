//! Ingestion daemon entrypoint.
//! Loads config, opens the SQLite store, recovers dedup/trend state and
//! runs the scheduler until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dugtrio_trends::analyze::CompositeScorer;
use dugtrio_trends::config::load_config_default;
use dugtrio_trends::ingest::providers::XRecentSearchFeed;
use dugtrio_trends::metrics::{ensure_described, install_prometheus};
use dugtrio_trends::{IngestionScheduler, SchedulerDeps, SqliteSignalStore, SystemClock};

const DEFAULT_DATABASE_PATH: &str = "dugtrio.db";

/// Compact text logs by default, JSON when `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dugtrio_trends=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default()?;
    tracing::info!(?cfg, "pipeline config loaded");

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("parsing METRICS_ADDR {addr:?}"))?;
        install_prometheus(addr)?;
        tracing::info!(%addr, "prometheus exporter listening");
    } else {
        ensure_described();
    }

    let db_path =
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
    let store = SqliteSignalStore::open(&db_path)
        .await
        .with_context(|| format!("opening signal store at {db_path}"))?;

    let token = std::env::var("X_BEARER_TOKEN").context("X_BEARER_TOKEN must be set")?;
    let feed = XRecentSearchFeed::new(token);

    let deps = SchedulerDeps::from_config(
        &cfg,
        Arc::new(SystemClock),
        Arc::new(feed),
        Arc::new(CompositeScorer::new(None)),
        Arc::new(store),
    );
    let scheduler = Arc::new(IngestionScheduler::new(cfg, deps));
    scheduler
        .recover()
        .await
        .context("recovering dedup and trend state")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(stop_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested; finishing current tick");
    let _ = stop_tx.send(true);
    runner.await.context("scheduler task panicked")?;

    Ok(())
}
