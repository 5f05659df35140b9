//! User queries
//!
//! Registration and credential rotation are out of scope for the
//! coordinator; users are provisioned rows. Lookup is by the SHA-256
//! digest of the presented bearer token.

use crate::error::Result;
use crate::models::User;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Find the user owning an API token, by token digest
pub async fn find_by_token_hash(pool: &SqlitePool, token_hash: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, handle, credential_hash FROM users WHERE api_token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Insert a user row (provisioning and test setup)
pub async fn insert(
    pool: &SqlitePool,
    id: Uuid,
    handle: &str,
    credential_hash: &str,
    api_token_hash: Option<&str>,
    now_micros: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, handle, credential_hash, api_token_hash, created_micros)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(handle)
    .bind(credential_hash)
    .bind(api_token_hash)
    .bind(now_micros)
    .execute(pool)
    .await?;
    Ok(())
}
