//! Species queries
//!
//! Species rows exist purely as classifier output. Upsert is idempotent
//! on the species code and never touches asset URLs; asset attachment is
//! a separate conditional write that only the first caller wins.

use crate::error::Result;
use crate::models::Species;
use sqlx::SqlitePool;
use uuid::Uuid;

const SPECIES_COLUMNS: &str =
    "id, code, common_name, scientific_name, asset_url, gif_url, created_micros";

/// Insert or refresh a species by code
///
/// Names are refreshed from the latest classifier response; asset URLs
/// are never overwritten here.
pub async fn upsert(
    pool: &SqlitePool,
    id: Uuid,
    code: &str,
    common_name: &str,
    scientific_name: &str,
    now_micros: i64,
) -> Result<Species> {
    sqlx::query(
        "INSERT INTO species (id, code, common_name, scientific_name, created_micros)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(code) DO UPDATE SET
            common_name = excluded.common_name,
            scientific_name = excluded.scientific_name",
    )
    .bind(id)
    .bind(code)
    .bind(common_name)
    .bind(scientific_name)
    .bind(now_micros)
    .execute(pool)
    .await?;

    let species = sqlx::query_as::<_, Species>(&format!(
        "SELECT {SPECIES_COLUMNS} FROM species WHERE code = ?"
    ))
    .bind(code)
    .fetch_one(pool)
    .await?;
    Ok(species)
}

/// Attach generated art to a species, first writer wins
///
/// The write only lands while the current asset URL is NULL. On conflict
/// the stored row (the race winner's) is returned, so callers can simply
/// use whatever comes back.
pub async fn set_asset(
    pool: &SqlitePool,
    code: &str,
    asset_url: &str,
    gif_url: Option<&str>,
) -> Result<Species> {
    let result = sqlx::query(
        "UPDATE species SET asset_url = ?, gif_url = ? WHERE code = ? AND asset_url IS NULL",
    )
    .bind(asset_url)
    .bind(gif_url)
    .bind(code)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        tracing::debug!(code, "Species asset already set; keeping existing");
    }

    let species = sqlx::query_as::<_, Species>(&format!(
        "SELECT {SPECIES_COLUMNS} FROM species WHERE code = ?"
    ))
    .bind(code)
    .fetch_one(pool)
    .await?;
    Ok(species)
}

/// Fetch a species by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Species>> {
    let species = sqlx::query_as::<_, Species>(&format!(
        "SELECT {SPECIES_COLUMNS} FROM species WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(species)
}

/// Fetch a species by classifier code
pub async fn get_by_code(pool: &SqlitePool, code: &str) -> Result<Option<Species>> {
    let species = sqlx::query_as::<_, Species>(&format!(
        "SELECT {SPECIES_COLUMNS} FROM species WHERE code = ?"
    ))
    .bind(code)
    .fetch_optional(pool)
    .await?;
    Ok(species)
}

/// List all known species, alphabetically by common name
pub async fn list(pool: &SqlitePool) -> Result<Vec<Species>> {
    let species = sqlx::query_as::<_, Species>(&format!(
        "SELECT {SPECIES_COLUMNS} FROM species ORDER BY common_name"
    ))
    .fetch_all(pool)
    .await?;
    Ok(species)
}
