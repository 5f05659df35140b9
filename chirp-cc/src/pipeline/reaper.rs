//! Orphan reaper
//!
//! A worker can die between transitions, leaving its capture parked in a
//! non-terminal state forever. The reaper periodically sweeps captures
//! whose last state change is older than the configured age and moves
//! them to `failed:Orphaned` through the same conditional write the
//! workers use, so a capture that advances between scan and sweep is
//! left alone.

use crate::db::captures;
use crate::error::Result;
use crate::models::{CaptureStatus, FailureReason};
use crate::pipeline::fail_capture;
use chirp_common::events::EventBus;
use chirp_common::time::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodic sweeper for stuck captures
pub struct Reaper {
    db: SqlitePool,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_age: Duration,
}

impl Reaper {
    pub fn new(
        db: SqlitePool,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            clock,
            interval,
            max_age,
        }
    }

    /// Run sweeps until shutdown
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Reaper sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: orphan every capture stuck past the age threshold
    ///
    /// Returns how many captures this sweep actually transitioned.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = self.clock.now_micros() - self.max_age.as_micros() as i64;
        let stale = captures::stale_non_terminal(&self.db, cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        tracing::warn!(count = stale.len(), "Orphaning stuck captures");
        let mut reaped = 0;
        for capture_id in stale {
            let applied = fail_capture(
                &self.db,
                &self.bus,
                self.clock.as_ref(),
                capture_id,
                &CaptureStatus::non_terminal(),
                FailureReason::Orphaned,
            )
            .await?;
            if applied {
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
