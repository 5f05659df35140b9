//! Species reads
//!
//! Species rows are created by the pipeline as classifier output; these
//! endpoints only expose them.

use super::auth::AuthedUser;
use super::captures::SpeciesView;
use crate::db::species;
use crate::error::{Error, Result};
use crate::AppState;
use axum::extract::{Path, State};
use axum::Json;

/// GET /v1/species - all known species
pub async fn list_species(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Result<Json<serde_json::Value>> {
    let all = species::list(&state.db).await?;
    let views: Vec<SpeciesView> = all.into_iter().map(SpeciesView::from).collect();
    let total = views.len();
    Ok(Json(serde_json::json!({
        "species": views,
        "total": total,
    })))
}

/// GET /v1/species/:code - one species by classifier code
pub async fn get_species(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(code): Path<String>,
) -> Result<Json<SpeciesView>> {
    let found = species::get_by_code(&state.db, &code)
        .await?
        .ok_or_else(|| Error::NotFound(format!("species {}", code)))?;
    Ok(Json(SpeciesView::from(found)))
}
