//! Request authentication
//!
//! Token issuance is out of scope; the coordinator validates bearer
//! tokens against a stored SHA-256 digest. The same validation backs
//! both the `Authorization` header on REST calls and the `token` query
//! parameter on gateway upgrades.

use crate::error::{Error, Result};
use crate::{db, AppState};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Authenticated caller, extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: Uuid,
    pub handle: String,
}

/// SHA-256 hex digest of a presented token
pub fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Resolve a raw token to its user
pub async fn authenticate_token(pool: &SqlitePool, token: &str) -> Result<AuthedUser> {
    let digest = token_digest(token);
    match db::users::find_by_token_hash(pool, &digest).await? {
        Some(user) => Ok(AuthedUser {
            id: user.id,
            handle: user.handle,
        }),
        None => Err(Error::AuthInvalid),
    }
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(Error::AuthMissing)?;

        let token = header.strip_prefix("Bearer ").ok_or(Error::AuthMissing)?;
        if token.is_empty() {
            return Err(Error::AuthMissing);
        }
        authenticate_token(&state.db, token).await
    }
}
