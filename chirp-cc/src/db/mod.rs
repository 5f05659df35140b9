//! Database layer
//!
//! Coarse-grained repository operations over a SQLite pool. Every
//! mutating operation runs in a single transaction; capture state is
//! guarded by conditional writes (`WHERE status IN (...)`) instead of
//! in-process locks; the database is the sole source of truth.

pub mod captures;
pub mod devices;
pub mod species;
pub mod users;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Open (creating if necessary) the coordinator database and apply the schema
pub async fn init_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool with schema, for tests and ad-hoc runs
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes if they do not exist
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BLOB PRIMARY KEY,
            handle TEXT NOT NULL UNIQUE,
            credential_hash TEXT NOT NULL,
            api_token_hash TEXT UNIQUE,
            created_micros INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            user_id BLOB NOT NULL REFERENCES users(id),
            firmware_version TEXT NOT NULL,
            capabilities TEXT,
            last_seen_micros INTEGER NOT NULL,
            battery_voltage REAL,
            rssi INTEGER,
            created_micros INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS species (
            id BLOB PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            common_name TEXT NOT NULL,
            scientific_name TEXT NOT NULL,
            asset_url TEXT,
            gif_url TEXT,
            created_micros INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS captures (
            id BLOB PRIMARY KEY,
            user_id BLOB NOT NULL REFERENCES users(id),
            device_id TEXT NOT NULL REFERENCES devices(id),
            clip_key TEXT NOT NULL,
            device_seq INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            species_id BLOB REFERENCES species(id),
            confidence REAL,
            failure_reason TEXT,
            note TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            recorded_micros INTEGER,
            received_micros INTEGER NOT NULL,
            processed_micros INTEGER,
            updated_micros INTEGER NOT NULL,
            UNIQUE(device_id, device_seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_captures_user_received
         ON captures(user_id, received_micros DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_captures_status_updated
         ON captures(status, updated_micros)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_applies_twice() {
        let pool = init_memory_pool().await.unwrap();
        // Idempotent re-apply
        create_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in ["captures", "devices", "species", "users"] {
            assert!(names.contains(&expected), "missing table {}", expected);
        }
    }
}
