//! HTTP API
//!
//! Ingress handlers plus the WebSocket subscription gateway. Every
//! internal error is mapped to an HTTP code by the service error type;
//! pipeline outcomes never surface here synchronously; clients learn
//! about them through capture status and gateway events.

pub mod auth;
pub mod captures;
pub mod devices;
pub mod health;
pub mod species;
pub mod ws;

use crate::AppState;
use axum::routing::{get, post};
use axum::Router;

pub fn device_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/devices/register", post(devices::register))
        .route("/v1/devices/:id/heartbeat", post(devices::heartbeat))
        .route("/v1/devices/:id", get(devices::get_device))
        .route("/v1/devices", get(devices::list_devices))
}

pub fn capture_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/captures", post(captures::upload).get(captures::list))
        .route("/v1/captures/:id", get(captures::get_capture))
}

pub fn species_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/species", get(species::list_species))
        .route("/v1/species/:code", get(species::get_species))
}

pub fn gateway_routes() -> Router<AppState> {
    Router::new().route("/v1/ws", get(ws::upgrade))
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health::health))
}
