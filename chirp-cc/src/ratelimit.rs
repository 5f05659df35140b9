//! Per-device upload rate limiting
//!
//! Token bucket per device id: capacity is the burst allowance, refill
//! is the sustained per-minute rate. Buckets live in one map guarded by
//! a short mutex; a background sweep evicts buckets idle long enough to
//! be full again, so the map tracks active devices only.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Token taken; proceed
    Allowed,
    /// Bucket empty; retry after the given delay
    Limited { retry_after: Duration },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Keyed token-bucket limiter
pub struct DeviceRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl DeviceRateLimiter {
    /// `per_minute` sustained rate with `burst` immediate allowance
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: f64::from(burst.max(1)),
            refill_per_sec: f64::from(per_minute.max(1)) / 60.0,
        }
    }

    /// Try to take one token for `device_id`
    pub fn check(&self, device_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(device_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = deficit / self.refill_per_sec;
            RateDecision::Limited {
                retry_after: Duration::from_secs_f64(wait.max(1.0)),
            }
        }
    }

    /// Drop buckets idle longer than `idle_for`
    ///
    /// An idle bucket has refilled to capacity anyway, so evicting it
    /// changes nothing for the device.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_for);
        before - buckets.len()
    }

    /// Number of tracked devices
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Periodic eviction loop; runs until shutdown
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        every: Duration,
        idle_for: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(idle_for);
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted idle rate-limit buckets");
                    }
                }
            }
        }
    }
}
