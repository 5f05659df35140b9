//! Device queries
//!
//! Devices are registered on first use and refreshed by heartbeats.
//! `last_seen` only moves forward: out-of-order heartbeats are absorbed
//! without writing, which keeps the column monotonic under clock skew
//! and delayed delivery.

use crate::error::{Error, Result};
use crate::models::Device;
use sqlx::SqlitePool;
use uuid::Uuid;

const DEVICE_COLUMNS: &str = "id, user_id, firmware_version, capabilities, \
     last_seen_micros, battery_voltage, rssi, created_micros";

/// Create the device on first use, or refresh firmware/capabilities
///
/// Returns the stored row and whether it was newly created. A device id
/// already owned by a different user is rejected.
pub async fn register_or_update(
    pool: &SqlitePool,
    device_id: &str,
    user_id: Uuid,
    firmware_version: &str,
    capabilities: Option<&str>,
    now_micros: i64,
) -> Result<(Device, bool)> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
    ))
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?;

    let created = match existing {
        Some(device) if device.user_id != user_id => {
            return Err(Error::NotOwned(device_id.to_string()));
        }
        Some(_) => {
            sqlx::query(
                "UPDATE devices
                 SET firmware_version = ?,
                     capabilities = ?,
                     last_seen_micros = MAX(last_seen_micros, ?)
                 WHERE id = ?",
            )
            .bind(firmware_version)
            .bind(capabilities)
            .bind(now_micros)
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
            false
        }
        None => {
            sqlx::query(
                "INSERT INTO devices
                 (id, user_id, firmware_version, capabilities, last_seen_micros, created_micros)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(device_id)
            .bind(user_id)
            .bind(firmware_version)
            .bind(capabilities)
            .bind(now_micros)
            .bind(now_micros)
            .execute(&mut *tx)
            .await?;
            true
        }
    };

    let device = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
    ))
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((device, created))
}

/// Apply a heartbeat: telemetry plus a forward-only `last_seen` update
///
/// A heartbeat older than the stored `last_seen` is ignored entirely, so
/// replaying heartbeats in any order converges to the same row.
pub async fn touch(
    pool: &SqlitePool,
    device_id: &str,
    heartbeat_micros: i64,
    battery_voltage: Option<f64>,
    rssi: Option<i64>,
) -> Result<Device> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE devices
         SET last_seen_micros = ?, battery_voltage = ?, rssi = ?
         WHERE id = ? AND last_seen_micros < ?",
    )
    .bind(heartbeat_micros)
    .bind(battery_voltage)
    .bind(rssi)
    .bind(device_id)
    .bind(heartbeat_micros)
    .execute(&mut *tx)
    .await?;

    let device = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
    ))
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

    tx.commit().await?;

    if updated.rows_affected() == 0 {
        tracing::debug!(device_id, heartbeat_micros, "Stale heartbeat ignored");
    }
    Ok(device)
}

/// Fetch one device by id
pub async fn get(pool: &SqlitePool, device_id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"
    ))
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(device)
}

/// List a user's devices, most recently seen first
pub async fn list_for_user(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ? ORDER BY last_seen_micros DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(devices)
}
