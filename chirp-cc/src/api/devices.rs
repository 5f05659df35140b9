//! Device ingress: registration, heartbeat, reads

use super::auth::AuthedUser;
use crate::db::devices;
use crate::error::{Error, Result};
use crate::models::Device;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub firmware_version: String,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Device clock, ISO 8601
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub battery_voltage: Option<f64>,
    #[serde(default)]
    pub rssi: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub firmware_version: String,
    pub capabilities: Value,
    pub last_seen: DateTime<Utc>,
    pub battery_voltage: Option<f64>,
    pub rssi: Option<i64>,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            device_id: device.id.clone(),
            firmware_version: device.firmware_version.clone(),
            capabilities: device.capabilities_json(),
            last_seen: device.last_seen(),
            battery_voltage: device.battery_voltage,
            rssi: device.rssi,
        }
    }
}

/// POST /v1/devices/register - create or refresh the caller's device
///
/// Idempotent: 201 on first registration, 200 afterwards.
pub async fn register(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(request): Json<RegisterRequest>,
) -> Result<Response> {
    if request.device_id.is_empty() {
        return Err(Error::BadRequest("device_id must not be empty".to_string()));
    }

    let capabilities = request.capabilities.as_ref().map(Value::to_string);
    let (device, created) = devices::register_or_update(
        &state.db,
        &request.device_id,
        user.id,
        &request.firmware_version,
        capabilities.as_deref(),
        state.clock.now_micros(),
    )
    .await?;

    tracing::info!(
        device_id = %device.id,
        user = %user.handle,
        created,
        "Device registered"
    );

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(DeviceView::from(device))).into_response())
}

/// POST /v1/devices/:id/heartbeat - telemetry update
///
/// `last_seen` only moves forward; stale heartbeats return the stored
/// state unchanged.
pub async fn heartbeat(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(device_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<DeviceView>> {
    let device = devices::get(&state.db, &device_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;
    if device.user_id != user.id {
        return Err(Error::NotOwned(device_id));
    }

    let device = devices::touch(
        &state.db,
        &device_id,
        request.timestamp.timestamp_micros(),
        request.battery_voltage,
        request.rssi,
    )
    .await?;
    Ok(Json(DeviceView::from(device)))
}

/// GET /v1/devices/:id - one device, owner only
pub async fn get_device(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceView>> {
    let device = devices::get(&state.db, &device_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;
    if device.user_id != user.id {
        return Err(Error::NotOwned(device_id));
    }
    Ok(Json(DeviceView::from(device)))
}

/// GET /v1/devices - the caller's devices
pub async fn list_devices(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Value>> {
    let devices = devices::list_for_user(&state.db, user.id).await?;
    let views: Vec<DeviceView> = devices.into_iter().map(DeviceView::from).collect();
    let count = views.len();
    Ok(Json(serde_json::json!({
        "devices": views,
        "count": count,
    })))
}
