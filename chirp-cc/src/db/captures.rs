//! Capture queries
//!
//! The capture row is the durable record of one uploaded clip. Two
//! invariants are enforced here and nowhere else:
//!
//! - `(device_id, device_seq)` is unique, making duplicate uploads
//!   idempotent.
//! - State moves only through `transition`, whose `from` guard is a
//!   conditional write; a row that already left the expected state is
//!   left untouched and the caller told so. No two workers can hold the
//!   same capture in a non-terminal state.

use crate::error::Result;
use crate::models::{Capture, CaptureStatus};
use sqlx::SqlitePool;
use uuid::Uuid;

const CAPTURE_COLUMNS: &str = "id, user_id, device_id, clip_key, device_seq, content_type, \
     status, species_id, confidence, failure_reason, note, attempts, \
     recorded_micros, received_micros, processed_micros, updated_micros";

/// Outcome of `create`
#[derive(Debug)]
pub enum CreateOutcome {
    /// Fresh row in `pending`
    Created(Capture),
    /// `(device_id, device_seq)` already seen; the stored row
    DuplicateSequence(Capture),
}

/// Outcome of `transition`
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Guard held; the updated row
    Applied(Capture),
    /// Row absent or not in any of the expected states
    Invalid { current: Option<CaptureStatus> },
}

/// Field updates applied together with a state transition
#[derive(Debug, Default, Clone)]
pub struct TransitionPatch {
    pub species_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
    /// Stamp `processed_micros` with the transition time
    pub set_processed_at: bool,
    /// Increment the attempt counter (claim transitions)
    pub bump_attempts: bool,
}

impl TransitionPatch {
    pub fn claim() -> Self {
        Self {
            bump_attempts: true,
            ..Self::default()
        }
    }

    pub fn failure(reason: crate::models::FailureReason) -> Self {
        Self {
            failure_reason: Some(reason.to_string()),
            set_processed_at: true,
            ..Self::default()
        }
    }
}

/// Create a capture row in `pending`
///
/// A duplicate `(device_id, device_seq)` resolves to the existing row so
/// ingress can replay the original response.
#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &SqlitePool,
    id: Uuid,
    user_id: Uuid,
    device_id: &str,
    clip_key: &str,
    device_seq: i64,
    content_type: &str,
    recorded_micros: Option<i64>,
    now_micros: i64,
) -> Result<CreateOutcome> {
    let inserted = sqlx::query(
        "INSERT INTO captures
         (id, user_id, device_id, clip_key, device_seq, content_type,
          status, recorded_micros, received_micros, updated_micros)
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(device_id)
    .bind(clip_key)
    .bind(device_seq)
    .bind(content_type)
    .bind(recorded_micros)
    .bind(now_micros)
    .bind(now_micros)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {
            let capture = get(pool, id)
                .await?
                .ok_or_else(|| sqlx::Error::RowNotFound)?;
            Ok(CreateOutcome::Created(capture))
        }
        Err(sqlx::Error::Database(db_err))
            if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
        {
            let existing = find_by_device_seq(pool, device_id, device_seq)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            Ok(CreateOutcome::DuplicateSequence(existing))
        }
        Err(e) => Err(e.into()),
    }
}

/// Conditionally move a capture between states
///
/// The row is updated only while its status is one of `from`; this is
/// the optimistic-concurrency guard the whole pipeline leans on. The
/// whole check-and-set runs in one transaction.
pub async fn transition(
    pool: &SqlitePool,
    id: Uuid,
    from: &[CaptureStatus],
    to: CaptureStatus,
    patch: &TransitionPatch,
    now_micros: i64,
) -> Result<TransitionOutcome> {
    debug_assert!(!from.is_empty());
    let placeholders = vec!["?"; from.len()].join(", ");

    let mut tx = pool.begin().await?;

    let sql = format!(
        "UPDATE captures SET
            status = ?,
            updated_micros = ?,
            attempts = attempts + ?,
            species_id = COALESCE(?, species_id),
            confidence = COALESCE(?, confidence),
            failure_reason = COALESCE(?, failure_reason),
            note = COALESCE(?, note),
            processed_micros = CASE WHEN ? THEN ? ELSE processed_micros END
         WHERE id = ? AND status IN ({placeholders})"
    );

    let mut query = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(now_micros)
        .bind(if patch.bump_attempts { 1 } else { 0 })
        .bind(patch.species_id)
        .bind(patch.confidence)
        .bind(patch.failure_reason.as_deref())
        .bind(patch.note.as_deref())
        .bind(patch.set_processed_at)
        .bind(now_micros)
        .bind(id);
    for state in from {
        query = query.bind(state.as_str());
    }

    let result = query.execute(&mut *tx).await?;

    if result.rows_affected() == 0 {
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM captures WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;
        return Ok(TransitionOutcome::Invalid {
            current: current.and_then(|(s,)| CaptureStatus::parse(&s)),
        });
    }

    let capture = sqlx::query_as::<_, Capture>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(TransitionOutcome::Applied(capture))
}

/// Fetch one capture by id
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Capture>> {
    let capture = sqlx::query_as::<_, Capture>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(capture)
}

/// Fetch one capture visible to a specific user
pub async fn get_for_user(pool: &SqlitePool, id: Uuid, user_id: Uuid) -> Result<Option<Capture>> {
    let capture = sqlx::query_as::<_, Capture>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ? AND user_id = ?"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(capture)
}

/// Look up the capture created for a device sequence number
pub async fn find_by_device_seq(
    pool: &SqlitePool,
    device_id: &str,
    device_seq: i64,
) -> Result<Option<Capture>> {
    let capture = sqlx::query_as::<_, Capture>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM captures WHERE device_id = ? AND device_seq = ?"
    ))
    .bind(device_id)
    .bind(device_seq)
    .fetch_optional(pool)
    .await?;
    Ok(capture)
}

/// One page of a user's captures, newest first
///
/// Keyset pagination on `(received_micros, id)`: the cursor is the last
/// row of the previous page. Blob id comparison is only a deterministic
/// tie-break for identical timestamps.
pub async fn list_page(
    pool: &SqlitePool,
    user_id: Uuid,
    cursor: Option<(i64, Uuid)>,
    limit: i64,
) -> Result<Vec<Capture>> {
    let captures = match cursor {
        Some((received, id)) => {
            sqlx::query_as::<_, Capture>(&format!(
                "SELECT {CAPTURE_COLUMNS} FROM captures
                 WHERE user_id = ?
                   AND (received_micros < ? OR (received_micros = ? AND id < ?))
                 ORDER BY received_micros DESC, id DESC
                 LIMIT ?"
            ))
            .bind(user_id)
            .bind(received)
            .bind(received)
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Capture>(&format!(
                "SELECT {CAPTURE_COLUMNS} FROM captures
                 WHERE user_id = ?
                 ORDER BY received_micros DESC, id DESC
                 LIMIT ?"
            ))
            .bind(user_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(captures)
}

/// Ids of captures stuck in a non-terminal state since before `cutoff`
///
/// The reaper feeds these back through `transition`, so a capture that
/// advances between scan and sweep is skipped by the usual guard.
pub async fn stale_non_terminal(pool: &SqlitePool, cutoff_micros: i64) -> Result<Vec<Uuid>> {
    let states = CaptureStatus::non_terminal();
    let placeholders = vec!["?"; states.len()].join(", ");

    let sql =
        format!("SELECT id FROM captures WHERE status IN ({placeholders}) AND updated_micros < ?");
    let mut query = sqlx::query_as::<_, (Uuid,)>(&sql);
    for state in states {
        query = query.bind(state.as_str());
    }
    let rows = query.bind(cutoff_micros).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
