//! Capture pipeline
//!
//! The per-capture state machine:
//!
//! ```text
//! pending -> classifying -> classified -> processed
//!                |               \-> generating -> processed
//!                \-> failed           (art failure still ends processed)
//! ```
//!
//! A worker owns a capture exclusively while it holds the `classifying`
//! or `generating` state; ownership is taken and released through
//! conditional transitions, so a lost claim means another worker (or the
//! reaper) got there first and this run aborts silently. Classification
//! failure is terminal; art failure is not: classification is the
//! primary value, art is a bonus.

pub mod reaper;

use crate::db::captures::{self, TransitionOutcome, TransitionPatch};
use crate::db::species;
use crate::error::Result;
use crate::inference::{Classifier, Generator};
use crate::models::{
    Capture, CaptureStatus, FailureReason, Species, NOTE_ART_UNAVAILABLE,
};
use crate::store::{BlobStore, StoreError};
use chirp_common::events::{CaptureEvent, EventBus, SpeciesRef};
use chirp_common::ids::IdMinter;
use chirp_common::time::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything one pipeline run needs, shared across workers
pub struct CapturePipeline {
    db: SqlitePool,
    clip_store: Arc<dyn BlobStore>,
    asset_store: Arc<dyn BlobStore>,
    classifier: Arc<dyn Classifier>,
    generator: Arc<dyn Generator>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdMinter>,
}

impl CapturePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        clip_store: Arc<dyn BlobStore>,
        asset_store: Arc<dyn BlobStore>,
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn Generator>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdMinter>,
    ) -> Self {
        Self {
            db,
            clip_store,
            asset_store,
            classifier,
            generator,
            bus,
            clock,
            ids,
        }
    }

    /// Run one capture to a terminal state
    ///
    /// Safe to call any number of times for the same id: only the call
    /// that wins the `pending -> classifying` claim does any work.
    pub async fn run(&self, capture_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        // Claim. Losing the guard means the job was already claimed or
        // terminated; dispatcher retries stay harmless.
        let capture = match captures::transition(
            &self.db,
            capture_id,
            &[CaptureStatus::Pending],
            CaptureStatus::Classifying,
            &TransitionPatch::claim(),
            self.clock.now_micros(),
        )
        .await?
        {
            TransitionOutcome::Applied(capture) => capture,
            TransitionOutcome::Invalid { current } => {
                tracing::debug!(%capture_id, ?current, "Claim lost, skipping run");
                return Ok(());
            }
        };

        tracing::info!(%capture_id, device_id = %capture.device_id, attempt = capture.attempts, "Capture claimed");
        self.publish_progress(&capture, CaptureStatus::Classifying);

        if cancel.is_cancelled() {
            self.fail(&capture, &[CaptureStatus::Classifying], FailureReason::Shutdown)
                .await?;
            return Ok(());
        }

        // Fetch the clip bytes.
        let clip = match self.clip_store.get(&capture.clip_key).await {
            Ok(clip) => clip,
            Err(e) => {
                if !matches!(e, StoreError::NotFound(_)) {
                    tracing::error!(%capture_id, error = %e, "Clip fetch failed");
                }
                self.fail(&capture, &[CaptureStatus::Classifying], FailureReason::ClipMissing)
                    .await?;
                return Ok(());
            }
        };

        // Classify. The capture id doubles as the idempotency key.
        let verdict = match self
            .classifier
            .classify(&clip, &capture.content_type, capture_id)
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(%capture_id, error = %e, "Classification failed");
                self.fail(&capture, &[CaptureStatus::Classifying], e.failure_reason())
                    .await?;
                return Ok(());
            }
        };

        // Winding down: finish the call in flight, then stop.
        if cancel.is_cancelled() {
            self.fail(&capture, &[CaptureStatus::Classifying], FailureReason::Shutdown)
                .await?;
            return Ok(());
        }

        let species = species::upsert(
            &self.db,
            self.ids.mint(),
            &verdict.species_code,
            &verdict.common_name,
            &verdict.scientific_name,
            self.clock.now_micros(),
        )
        .await?;

        let capture = match captures::transition(
            &self.db,
            capture_id,
            &[CaptureStatus::Classifying],
            CaptureStatus::Classified,
            &TransitionPatch {
                species_id: Some(species.id),
                confidence: Some(verdict.confidence),
                ..TransitionPatch::default()
            },
            self.clock.now_micros(),
        )
        .await?
        {
            TransitionOutcome::Applied(capture) => capture,
            TransitionOutcome::Invalid { current } => {
                // Reaped out from under us mid-flight; stop quietly.
                tracing::warn!(%capture_id, ?current, "Lost capture after classification");
                return Ok(());
            }
        };
        self.publish_progress(&capture, CaptureStatus::Classified);

        // Art already exists: done.
        if species.asset_url.is_some() {
            self.finish(&capture, CaptureStatus::Classified, &species, None)
                .await?;
            return Ok(());
        }

        // New species: move to generating and try for art.
        let capture = match captures::transition(
            &self.db,
            capture_id,
            &[CaptureStatus::Classified],
            CaptureStatus::Generating,
            &TransitionPatch::default(),
            self.clock.now_micros(),
        )
        .await?
        {
            TransitionOutcome::Applied(capture) => capture,
            TransitionOutcome::Invalid { current } => {
                tracing::warn!(%capture_id, ?current, "Lost capture before generation");
                return Ok(());
            }
        };
        self.publish_progress(&capture, CaptureStatus::Generating);

        if cancel.is_cancelled() {
            self.fail(&capture, &[CaptureStatus::Generating], FailureReason::Shutdown)
                .await?;
            return Ok(());
        }

        match self.resolve_art(&capture, &species).await {
            Some(updated) => {
                self.finish(&capture, CaptureStatus::Generating, &updated, None)
                    .await?;
            }
            None => {
                self.finish(
                    &capture,
                    CaptureStatus::Generating,
                    &species,
                    Some(NOTE_ART_UNAVAILABLE),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Generate, re-home and attach art; `None` means art is unavailable
    ///
    /// Two workers may race here for the same new species. Both generate;
    /// the first `set_asset` wins and the loser simply adopts the stored
    /// row. No locking; the conditional write is the coordination point.
    async fn resolve_art(&self, capture: &Capture, species: &Species) -> Option<Species> {
        let art = match self
            .generator
            .generate(
                &species.code,
                &species.common_name,
                &species.scientific_name,
                capture.id,
            )
            .await
        {
            Ok(art) => art,
            Err(e) => {
                tracing::warn!(capture_id = %capture.id, code = %species.code, error = %e, "Art generation failed");
                return None;
            }
        };

        let bytes = match self.generator.download(&art.image_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(code = %species.code, error = %e, "Art download failed");
                return None;
            }
        };

        let url = match self
            .asset_store
            .put(&species.code, &bytes, "image/webp")
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(code = %species.code, error = %e, "Asset store put failed");
                return None;
            }
        };

        match species::set_asset(&self.db, &species.code, &url, art.gif_url.as_deref()).await {
            Ok(winner) => Some(winner),
            Err(e) => {
                tracing::error!(code = %species.code, error = %e, "Asset attach failed");
                None
            }
        }
    }

    /// Terminal `processed` transition plus event
    async fn finish(
        &self,
        capture: &Capture,
        from: CaptureStatus,
        species: &Species,
        note: Option<&str>,
    ) -> Result<()> {
        let patch = TransitionPatch {
            note: note.map(str::to_string),
            set_processed_at: true,
            ..TransitionPatch::default()
        };
        let outcome = captures::transition(
            &self.db,
            capture.id,
            &[from],
            CaptureStatus::Processed,
            &patch,
            self.clock.now_micros(),
        )
        .await?;

        match outcome {
            TransitionOutcome::Applied(done) => {
                tracing::info!(
                    capture_id = %done.id,
                    species = %species.code,
                    art = species.asset_url.is_some(),
                    "Capture processed"
                );
                self.bus.publish(
                    done.user_id,
                    CaptureEvent::Processed {
                        capture_id: done.id,
                        status: CaptureStatus::Processed.to_string(),
                        species: SpeciesRef {
                            code: species.code.clone(),
                            common_name: species.common_name.clone(),
                            scientific_name: species.scientific_name.clone(),
                        },
                        confidence: done.confidence.unwrap_or(0.0),
                        asset_url: species.asset_url.clone(),
                        timestamp: self.clock.now(),
                    },
                );
            }
            TransitionOutcome::Invalid { current } => {
                tracing::warn!(capture_id = %capture.id, ?current, "Lost capture at finish");
            }
        }
        Ok(())
    }

    /// Terminal `failed` transition plus event
    async fn fail(
        &self,
        capture: &Capture,
        from: &[CaptureStatus],
        reason: FailureReason,
    ) -> Result<()> {
        fail_capture(&self.db, &self.bus, self.clock.as_ref(), capture.id, from, reason).await?;
        Ok(())
    }

    fn publish_progress(&self, capture: &Capture, status: CaptureStatus) {
        self.bus.publish(
            capture.user_id,
            CaptureEvent::Progress {
                capture_id: capture.id,
                status: status.to_string(),
                timestamp: self.clock.now(),
            },
        );
    }
}

/// Move a capture to `failed` if it is still in one of `from`, emitting
/// the terminal event. Shared by the pipeline, the dispatcher (deadline
/// and shutdown), ingress (`Busy`) and the reaper (`Orphaned`).
///
/// Returns whether this call performed the transition.
pub async fn fail_capture(
    db: &SqlitePool,
    bus: &EventBus,
    clock: &dyn Clock,
    capture_id: Uuid,
    from: &[CaptureStatus],
    reason: FailureReason,
) -> Result<bool> {
    let outcome = captures::transition(
        db,
        capture_id,
        from,
        CaptureStatus::Failed,
        &TransitionPatch::failure(reason),
        clock.now_micros(),
    )
    .await?;

    match outcome {
        TransitionOutcome::Applied(capture) => {
            tracing::info!(%capture_id, %reason, "Capture failed");
            bus.publish(
                capture.user_id,
                CaptureEvent::Failed {
                    capture_id,
                    status: CaptureStatus::Failed.to_string(),
                    reason: reason.to_string(),
                    timestamp: clock.now(),
                },
            );
            Ok(true)
        }
        TransitionOutcome::Invalid { .. } => Ok(false),
    }
}
