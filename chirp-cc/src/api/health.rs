//! Health check endpoint

use axum::Json;
use serde_json::{json, Value};

/// GET /health - liveness probe, no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "chirp-cc",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
