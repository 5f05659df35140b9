//! Capture ingress and reads
//!
//! The upload handler is the critical path: admission, size and media
//! checks, per-device rate limiting, content-addressed clip storage,
//! durable capture row, then a non-blocking dispatcher submit. Duplicate
//! `(device_id, device_sequence)` uploads replay the stored capture with
//! 200 instead of creating a second row.

use super::auth::AuthedUser;
use crate::db::captures::{self, CreateOutcome};
use crate::db::{devices, species};
use crate::dispatch::Submit;
use crate::error::{Error, Result};
use crate::models::{Capture, CaptureStatus, FailureReason, Species};
use crate::pipeline::fail_capture;
use crate::ratelimit::RateDecision;
use crate::store::content_key;
use crate::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audio formats the coordinator accepts (bytes stay opaque; the
/// declared type is recorded and forwarded to the classifier)
const ACCEPTED_AUDIO: &[&str] = &[
    "audio/wav",
    "audio/x-wav",
    "audio/mpeg",
    "audio/flac",
    "audio/ogg",
];

/// Firmware recorded when a device is first seen via upload rather than
/// explicit registration
const FIRMWARE_UNKNOWN: &str = "unknown";

#[derive(Debug)]
struct UploadFields {
    clip: Vec<u8>,
    content_type: String,
    device_id: String,
    device_seq: i64,
    recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    capture_id: Uuid,
    status: String,
}

/// POST /v1/captures - multipart clip upload
pub async fn upload(
    State(state): State<AppState>,
    user: AuthedUser,
    multipart: Multipart,
) -> Result<Response> {
    let fields = read_upload(multipart, state.max_upload_bytes).await?;

    // Admission: the device must belong to the caller. First sight of a
    // device id registers it to the caller.
    match devices::get(&state.db, &fields.device_id).await? {
        Some(device) if device.user_id != user.id => {
            return Err(Error::NotOwned(fields.device_id));
        }
        Some(_) => {}
        None => {
            devices::register_or_update(
                &state.db,
                &fields.device_id,
                user.id,
                FIRMWARE_UNKNOWN,
                None,
                state.clock.now_micros(),
            )
            .await?;
        }
    }

    if !ACCEPTED_AUDIO.contains(&fields.content_type.as_str()) {
        return Err(Error::UnsupportedMedia(fields.content_type));
    }

    if let RateDecision::Limited { retry_after } = state.limiter.check(&fields.device_id) {
        return Err(Error::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        });
    }

    // Content-addressed storage makes duplicate clip bytes idempotent.
    let clip_key = content_key(&fields.clip);
    state
        .clip_store
        .put(&clip_key, &fields.clip, &fields.content_type)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

    let capture = match captures::create(
        &state.db,
        state.ids.mint(),
        user.id,
        &fields.device_id,
        &clip_key,
        fields.device_seq,
        &fields.content_type,
        fields.recorded_at.map(|t| t.timestamp_micros()),
        state.clock.now_micros(),
    )
    .await?
    {
        CreateOutcome::Created(capture) => capture,
        CreateOutcome::DuplicateSequence(existing) => {
            // Idempotent replay: same capture id, no re-submit. The
            // original job (or the reaper) owns completion.
            tracing::debug!(
                capture_id = %existing.id,
                device_id = %fields.device_id,
                device_seq = fields.device_seq,
                "Duplicate upload replayed"
            );
            return Ok((
                StatusCode::OK,
                Json(UploadResponse {
                    capture_id: existing.id,
                    status: existing.status,
                }),
            )
                .into_response());
        }
    };

    match state.dispatcher.submit(capture.id) {
        Submit::Accepted | Submit::AlreadyQueued => {
            tracing::info!(
                capture_id = %capture.id,
                device_id = %capture.device_id,
                bytes = fields.clip.len(),
                "Capture accepted"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(UploadResponse {
                    capture_id: capture.id,
                    status: capture.status,
                }),
            )
                .into_response())
        }
        Submit::Busy => {
            // Queue full: give the client a terminal answer right away
            // rather than leaving the row for the reaper.
            fail_capture(
                &state.db,
                &state.bus,
                state.clock.as_ref(),
                capture.id,
                &[CaptureStatus::Pending],
                FailureReason::Busy,
            )
            .await?;
            Err(Error::Busy {
                retry_after_secs: 5,
            })
        }
    }
}

/// Pull the expected fields out of the multipart body
async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> Result<UploadFields> {
    let mut clip: Option<(Vec<u8>, String)> = None;
    let mut device_id: Option<String> = None;
    let mut device_seq: Option<i64> = None;
    let mut recorded_at: Option<DateTime<Utc>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        // A body past the transport limit surfaces here rather than in
        // the explicit size check below.
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Error::PayloadTooLarge { limit: max_bytes }
        } else {
            Error::BadRequest(format!("invalid multipart body: {}", e))
        }
    })? {
        match field.name().unwrap_or_default() {
            "audio_file" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                        Error::PayloadTooLarge { limit: max_bytes }
                    } else {
                        Error::BadRequest(format!("unreadable audio_file: {}", e))
                    }
                })?;
                if bytes.len() > max_bytes {
                    return Err(Error::PayloadTooLarge { limit: max_bytes });
                }
                clip = Some((bytes.to_vec(), content_type));
            }
            "device_id" => {
                device_id = Some(read_text(field).await?);
            }
            "device_sequence" => {
                let raw = read_text(field).await?;
                device_seq = Some(raw.parse().map_err(|_| {
                    Error::BadRequest(format!("device_sequence must be an integer: {}", raw))
                })?);
            }
            "timestamp" => {
                let raw = read_text(field).await?;
                let parsed = raw.parse::<DateTime<Utc>>().map_err(|_| {
                    Error::BadRequest(format!("timestamp must be ISO 8601: {}", raw))
                })?;
                recorded_at = Some(parsed);
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    let (clip, content_type) =
        clip.ok_or_else(|| Error::BadRequest("audio_file is required".to_string()))?;
    if clip.is_empty() {
        return Err(Error::BadRequest("audio_file is empty".to_string()));
    }
    let device_id =
        device_id.ok_or_else(|| Error::BadRequest("device_id is required".to_string()))?;
    let device_seq =
        device_seq.ok_or_else(|| Error::BadRequest("device_sequence is required".to_string()))?;

    Ok(UploadFields {
        clip,
        content_type,
        device_id,
        device_seq,
        recorded_at,
    })
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| Error::BadRequest(format!("unreadable field: {}", e)))
}

// ---------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SpeciesView {
    pub code: String,
    pub common_name: String,
    pub scientific_name: String,
    pub asset_url: Option<String>,
    pub gif_url: Option<String>,
}

impl From<Species> for SpeciesView {
    fn from(species: Species) -> Self {
        Self {
            code: species.code,
            common_name: species.common_name,
            scientific_name: species.scientific_name,
            asset_url: species.asset_url,
            gif_url: species.gif_url,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CaptureView {
    pub capture_id: Uuid,
    pub device_id: String,
    pub device_sequence: i64,
    pub status: String,
    pub confidence: Option<f64>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
    pub clip_key: String,
    pub content_type: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species: Option<SpeciesView>,
}

impl CaptureView {
    fn new(capture: Capture, species: Option<Species>) -> Self {
        Self {
            capture_id: capture.id,
            device_id: capture.device_id.clone(),
            device_sequence: capture.device_seq,
            status: capture.status.clone(),
            confidence: capture.confidence,
            failure_reason: capture.failure_reason.clone(),
            note: capture.note.clone(),
            clip_key: capture.clip_key.clone(),
            content_type: capture.content_type.clone(),
            received_at: capture.received_at(),
            processed_at: capture.processed_at(),
            species: species.map(SpeciesView::from),
        }
    }
}

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

/// Encode the keyset cursor for the row after `capture`
fn encode_cursor(capture: &Capture) -> String {
    format!("{}~{}", capture.received_micros, capture.id)
}

/// Decode a client-provided cursor
fn decode_cursor(raw: &str) -> Result<(i64, Uuid)> {
    let (micros, id) = raw
        .split_once('~')
        .ok_or_else(|| Error::BadRequest(format!("malformed cursor: {}", raw)))?;
    let micros = micros
        .parse()
        .map_err(|_| Error::BadRequest(format!("malformed cursor: {}", raw)))?;
    let id = id
        .parse()
        .map_err(|_| Error::BadRequest(format!("malformed cursor: {}", raw)))?;
    Ok((micros, id))
}

/// GET /v1/captures?cursor=&limit= - the caller's captures, newest first
pub async fn list(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

    let page = captures::list_page(&state.db, user.id, cursor, limit).await?;
    let next_cursor = if page.len() as i64 == limit {
        page.last().map(encode_cursor)
    } else {
        None
    };

    let views: Vec<CaptureView> = page
        .into_iter()
        .map(|capture| CaptureView::new(capture, None))
        .collect();
    Ok(Json(serde_json::json!({
        "captures": views,
        "next_cursor": next_cursor,
    })))
}

/// GET /v1/captures/:id - one capture with joined species
pub async fn get_capture(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(capture_id): Path<Uuid>,
) -> Result<Json<CaptureView>> {
    let capture = captures::get_for_user(&state.db, capture_id, user.id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("capture {}", capture_id)))?;

    let joined = match capture.species_id {
        Some(species_id) => species::get(&state.db, species_id).await?,
        None => None,
    };
    Ok(Json(CaptureView::new(capture, joined)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip() {
        let capture_id = Uuid::new_v4();
        let raw = format!("1717243200000000~{}", capture_id);
        let (micros, id) = decode_cursor(&raw).unwrap();
        assert_eq!(micros, 1_717_243_200_000_000);
        assert_eq!(id, capture_id);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(decode_cursor("").is_err());
        assert!(decode_cursor("123").is_err());
        assert!(decode_cursor("abc~def").is_err());
        assert!(decode_cursor("123~not-a-uuid").is_err());
    }

    #[test]
    fn test_accepted_audio_set() {
        assert!(ACCEPTED_AUDIO.contains(&"audio/wav"));
        assert!(ACCEPTED_AUDIO.contains(&"audio/ogg"));
        assert!(!ACCEPTED_AUDIO.contains(&"video/mp4"));
    }
}
