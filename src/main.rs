// =============================================================================
// candlestream — Main Entry Point
// =============================================================================
//
// Trade feed → durable log → candle aggregator → {candle store, indicators →
// latest cache}.  The role decides which half of the pipeline this process
// runs; with the SQLite log backend the halves can run as separate
// processes over the same log file.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod config;
mod indicators;
mod market_data;
mod storage;
mod stream;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::AggregatorWorker;
use crate::app_state::{AppState, PipelineStats};
use crate::config::{AppConfig, LogBackend};
use crate::storage::{CandleStore, LatestCache, MemoryLatestCache, SqliteCandleStore};
use crate::stream::{MemoryLog, SqliteLog, StreamLog};

/// Config file read at startup unless `CANDLESTREAM_CONFIG` points elsewhere.
const DEFAULT_CONFIG_PATH: &str = "candlestream.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("CANDLESTREAM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let (mut config, load_error) = match AppConfig::load(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    config.apply_env().context("invalid environment override")?;
    let config = Arc::new(config.validate().context("invalid configuration")?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candlestream — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    if let Some(e) = load_error {
        warn!(path = %config_path, error = %format!("{e:#}"), "Failed to load config, using defaults");
    }
    info!(
        role = %config.role,
        symbols = ?config.symbols,
        candle_sec = config.candle_sec,
        log_backend = ?config.log_backend,
        "Configuration ready"
    );

    // ── 2. Durable log ───────────────────────────────────────────────────
    let log: Arc<dyn StreamLog> = match config.log_backend {
        LogBackend::Sqlite => Arc::new(
            SqliteLog::open(&config.log_db_path)
                .with_context(|| format!("failed to open stream log {}", config.log_db_path.display()))?,
        ),
        LogBackend::Memory => Arc::new(MemoryLog::new()),
    };
    let stats = Arc::new(PipelineStats::default());

    // ── 3. Trade ingestors (one task per symbol) ─────────────────────────
    if config.role.runs_ingest() {
        for symbol in &config.symbols {
            tokio::spawn(market_data::run_ingestor(
                config.clone(),
                log.clone(),
                stats.clone(),
                symbol.clone(),
            ));
        }
        info!(count = config.symbols.len(), "Trade ingestors launched");
    }

    // ── 4. Aggregator + read API ─────────────────────────────────────────
    if config.role.runs_aggregate() {
        let store: Arc<dyn CandleStore> = Arc::new(
            SqliteCandleStore::open(&config.sqlite_path, 4)
                .with_context(|| format!("failed to open candle store {}", config.sqlite_path.display()))?,
        );
        let cache: Arc<dyn LatestCache> = Arc::new(MemoryLatestCache::new());

        let worker = AggregatorWorker::new(
            config.clone(),
            log.clone(),
            store.clone(),
            cache.clone(),
            stats.clone(),
        );
        tokio::spawn(worker.run());
        info!(group = %config.consumer_group, consumer = %config.consumer_name, "Aggregator launched");

        let api_state = Arc::new(AppState::new(config.clone(), store, cache, stats.clone()));
        let listener = tokio::net::TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("failed to bind API server on {}", config.bind_addr))?;
        info!(addr = %config.bind_addr, "API server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    let final_stats = stats.snapshot();
    info!(
        trades_published = final_stats.trades_published,
        candles_sealed = final_stats.candles_sealed,
        dead_lettered = final_stats.dead_lettered,
        "candlestream shut down complete."
    );
    Ok(())
}
