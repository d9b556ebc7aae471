//! PolySpike - paper-mode spike/divergence engine
//!
//! Usage: cargo run --release
//! Config: config/default.{toml,yaml}, config/local.*, POLYSPIKE__SECTION__KEY env vars

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use polyspike::config::{AppConfig, LoggingConfig};
use polyspike::engine::Engine;
use polyspike::feed::{spawn_price_producer, ProducerSettings};
use polyspike::persistence::PersistenceStore;
use polyspike::sim::{LaggingQuoteSource, RandomWalkFeed, SpotBoard};

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    info!("🤖 PolySpike {} starting (paper mode)", config.bot.tag);
    info!("Config: {}", config.digest());

    let store = if config.persistence.enabled {
        PersistenceStore::new(&config.persistence.data_dir, config.persistence.write_retries)
            .context("Failed to initialize persistence")?
    } else {
        warn!("Persistence disabled, running in memory only");
        PersistenceStore::in_memory()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (price_tx, price_rx) = mpsc::channel(config.engine.price_channel_capacity);

    let board = SpotBoard::default();
    let quotes = LaggingQuoteSource::new(&config.bot.markets, &config.simulation, board.clone());

    let mut engine = Engine::new(config.clone(), Box::new(quotes), price_rx, store, Utc::now());
    engine.restore(Utc::now())?;

    let settings = ProducerSettings {
        fetch_timeout: Duration::from_millis(config.engine.fetch_timeout_ms),
        retry_initial: Duration::from_millis(config.engine.feed_retry_initial_ms),
        retry_max: Duration::from_millis(config.engine.feed_retry_max_ms),
    };
    let mut producers = Vec::new();
    for (i, symbol) in config.bot.symbols.iter().enumerate() {
        let feed = RandomWalkFeed::new(symbol, i as u64, &config.simulation, board.clone());
        producers.push(spawn_price_producer(
            Box::new(feed),
            price_tx.clone(),
            settings.clone(),
            shutdown_rx.clone(),
        ));
    }
    drop(price_tx);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down after the current tick");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    engine.run(shutdown_rx).await?;

    for producer in producers {
        if let Err(e) = producer.await {
            warn!(error = %e, "Price producer task failed");
        }
    }

    info!("👋 Bye");
    Ok(())
}
