//! chirp-cc - Chirp Capture Coordinator
//!
//! Accepts short audio clips from field devices, classifies each clip
//! into a bird species through the external classifier, attaches
//! generated art to first-seen species through the external generator,
//! persists everything, and pushes completion events to each owner's
//! connected clients over long-lived WebSocket sessions.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod ratelimit;
pub mod store;

use crate::dispatch::Dispatcher;
use crate::ratelimit::DeviceRateLimiter;
use crate::store::BlobStore;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use chirp_common::events::EventBus;
use chirp_common::ids::IdMinter;
use chirp_common::time::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdMinter>,
    pub clip_store: Arc<dyn BlobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<DeviceRateLimiter>,
    /// Cancelled on shutdown; gateway sessions watch it
    pub shutdown: CancellationToken,
    pub max_upload_bytes: usize,
    pub ws_ping_interval: Duration,
}

/// Build the coordinator router
///
/// Routes:
/// - POST /v1/devices/register - register or refresh a device
/// - POST /v1/devices/:id/heartbeat - device telemetry
/// - GET  /v1/devices / /v1/devices/:id - device reads
/// - POST /v1/captures - multipart clip upload
/// - GET  /v1/captures / /v1/captures/:id - capture reads
/// - GET  /v1/species / /v1/species/:code - species reads
/// - GET  /v1/ws - subscription gateway upgrade
/// - GET  /health - liveness, no auth
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + 64 * 1024; // multipart framing slack

    Router::new()
        .merge(api::device_routes())
        .merge(api::capture_routes())
        .merge(api::species_routes())
        .merge(api::gateway_routes())
        .merge(api::health_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
