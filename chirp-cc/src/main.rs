//! chirp-cc - Chirp Capture Coordinator service
//!
//! Wires the capture pipeline together: SQLite repository, filesystem
//! blob stores, HTTP inference clients behind retry + breakers, the
//! dispatcher worker pool, the orphan reaper, and the axum API with the
//! WebSocket subscription gateway.

use anyhow::Result;
use chirp_cc::config::Config;
use chirp_cc::dispatch::Dispatcher;
use chirp_cc::inference::breaker::{BreakerConfig, CircuitBreaker};
use chirp_cc::inference::retry::RetryPolicy;
use chirp_cc::inference::{HttpClassifier, HttpGenerator};
use chirp_cc::pipeline::reaper::Reaper;
use chirp_cc::pipeline::CapturePipeline;
use chirp_cc::ratelimit::DeviceRateLimiter;
use chirp_cc::store::FsBlobStore;
use chirp_cc::{build_router, AppState};
use chirp_common::events::EventBus;
use chirp_common::ids::RandomIds;
use chirp_common::time::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    info!("Starting chirp-cc (Capture Coordinator)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database_path.display());

    let db = chirp_cc::db::init_pool(&config.database_path).await?;
    info!("Database connection established");

    let clock = Arc::new(SystemClock);
    let ids = Arc::new(RandomIds);
    let bus = Arc::new(EventBus::new(config.event_buffer));

    let clip_store = Arc::new(FsBlobStore::sharded(
        &config.clip_store_path,
        &config.clip_base_url,
    ));
    let asset_store = Arc::new(FsBlobStore::flat(
        &config.asset_store_path,
        &config.asset_base_url,
    ));

    let retry = RetryPolicy::with_attempts(config.inference_attempts);
    let classifier = Arc::new(HttpClassifier::new(
        &config.classifier_url,
        config.classifier_deadline,
        retry,
        Arc::new(CircuitBreaker::new("classifier", BreakerConfig::default())),
    )?);
    let generator = Arc::new(HttpGenerator::new(
        &config.generator_url,
        config.generator_deadline,
        retry,
        Arc::new(CircuitBreaker::new("generator", BreakerConfig::default())),
    )?);

    let pipeline = Arc::new(CapturePipeline::new(
        db.clone(),
        clip_store.clone(),
        asset_store,
        classifier,
        generator,
        Arc::clone(&bus),
        clock.clone(),
        ids.clone(),
    ));

    let dispatcher = Dispatcher::start(
        pipeline,
        db.clone(),
        Arc::clone(&bus),
        clock.clone(),
        config.worker_pool_size,
        config.queue_capacity,
        config.job_deadline,
    );

    let shutdown = CancellationToken::new();

    let reaper = Reaper::new(
        db.clone(),
        Arc::clone(&bus),
        clock.clone(),
        config.reaper_interval,
        config.reaper_max_age,
    );
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

    let limiter = Arc::new(DeviceRateLimiter::new(
        config.rate_limit_per_minute,
        config.rate_limit_burst,
    ));
    let sweeper_task = tokio::spawn(Arc::clone(&limiter).run_sweeper(
        Duration::from_secs(60),
        Duration::from_secs(300),
        shutdown.clone(),
    ));

    let state = AppState {
        db,
        bus,
        clock,
        ids,
        clip_store,
        dispatcher: Arc::clone(&dispatcher),
        limiter,
        shutdown: shutdown.clone(),
        max_upload_bytes: config.max_upload_bytes,
        ws_ping_interval: config.ws_ping_interval,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop intake and drain: queued jobs become failed:shutdown, running
    // jobs wind down at their next stage boundary.
    shutdown.cancel();
    dispatcher.shutdown().await;
    let _ = reaper_task.await;
    let _ = sweeper_task.await;
    info!("chirp-cc stopped");

    Ok(())
}
