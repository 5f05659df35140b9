//! Dispatcher
//!
//! Fixed worker pool behind a bounded queue. Submission is non-blocking:
//! a full queue reports `Busy` and ingress turns that into a terminal
//! answer for the client. The queue is deduplicated by capture id: a
//! capture that is already queued or in flight is not enqueued twice.
//!
//! The dispatcher never retries jobs. A job runs exactly once to a
//! terminal state; retry logic lives entirely inside the inference
//! clients, and a crashed worker's capture is recovered by the reaper.

use crate::models::{CaptureStatus, FailureReason};
use crate::pipeline::{fail_capture, CapturePipeline};
use chirp_common::events::EventBus;
use chirp_common::time::Clock;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Submission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Queued for a worker
    Accepted,
    /// Already queued or in flight; nothing to do
    AlreadyQueued,
    /// Queue full (or shutting down)
    Busy,
}

/// Capture ids currently queued or running, for dedup
#[derive(Default)]
struct PendingSet {
    ids: Mutex<HashSet<Uuid>>,
}

impl PendingSet {
    /// Returns false when the id is already tracked
    fn insert(&self, id: Uuid) -> bool {
        self.ids.lock().insert(id)
    }

    fn remove(&self, id: &Uuid) {
        self.ids.lock().remove(id);
    }

    fn len(&self) -> usize {
        self.ids.lock().len()
    }
}

/// Bounded-concurrency scheduler driving the capture pipeline
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::Sender<Uuid>>>,
    pending: Arc<PendingSet>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `pool_size` workers behind a queue of `queue_capacity`
    pub fn start(
        pipeline: Arc<CapturePipeline>,
        db: SqlitePool,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        pool_size: usize,
        queue_capacity: usize,
        job_deadline: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Uuid>(queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let pending = Arc::new(PendingSet::default());
        let shutdown = CancellationToken::new();

        let mut workers = Vec::with_capacity(pool_size);
        for worker_index in 0..pool_size {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            let pipeline = Arc::clone(&pipeline);
            let db = db.clone();
            let bus = Arc::clone(&bus);
            let clock = Arc::clone(&clock);
            let shutdown = shutdown.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    // One receiver shared by the pool; hold the lock only
                    // for the dequeue itself.
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(capture_id) = job else {
                        tracing::debug!(worker_index, "Queue closed, worker exiting");
                        return;
                    };

                    if shutdown.is_cancelled() {
                        // Drain: queued jobs get a terminal answer instead
                        // of a run.
                        if let Err(e) = fail_capture(
                            &db,
                            &bus,
                            clock.as_ref(),
                            capture_id,
                            &CaptureStatus::non_terminal(),
                            FailureReason::Shutdown,
                        )
                        .await
                        {
                            tracing::error!(%capture_id, error = %e, "Shutdown fail-mark failed");
                        }
                        pending.remove(&capture_id);
                        continue;
                    }

                    let run = tokio::time::timeout(
                        job_deadline,
                        pipeline.run(capture_id, &shutdown),
                    )
                    .await;
                    match run {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::error!(%capture_id, error = %e, "Pipeline run failed");
                        }
                        Err(_) => {
                            tracing::warn!(%capture_id, "Job deadline exceeded");
                            if let Err(e) = fail_capture(
                                &db,
                                &bus,
                                clock.as_ref(),
                                capture_id,
                                &CaptureStatus::non_terminal(),
                                FailureReason::Deadline,
                            )
                            .await
                            {
                                tracing::error!(%capture_id, error = %e, "Deadline fail-mark failed");
                            }
                        }
                    }
                    pending.remove(&capture_id);
                }
            }));
        }

        tracing::info!(pool_size, queue_capacity, "Dispatcher started");
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            pending,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Non-blocking submission of a capture job
    pub fn submit(&self, capture_id: Uuid) -> Submit {
        if self.shutdown.is_cancelled() {
            return Submit::Busy;
        }
        if !self.pending.insert(capture_id) {
            return Submit::AlreadyQueued;
        }

        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            self.pending.remove(&capture_id);
            return Submit::Busy;
        };

        match tx.try_send(capture_id) {
            Ok(()) => Submit::Accepted,
            Err(_) => {
                self.pending.remove(&capture_id);
                Submit::Busy
            }
        }
    }

    /// Jobs currently queued or in flight
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop intake, drain the queue, and wait for workers
    ///
    /// Running jobs observe the cancellation token at their next stage
    /// boundary and end `failed:Shutdown`; jobs still queued are marked
    /// `failed:Shutdown` without running.
    pub async fn shutdown(&self) {
        tracing::info!("Dispatcher shutting down");
        self.shutdown.cancel();
        // Closing the channel lets workers drain what is left and exit.
        self.tx.lock().take();

        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker join failed");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}
