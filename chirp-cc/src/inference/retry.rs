//! Retry with exponential backoff and full jitter
//!
//! Applies to transport errors, upstream 5xx and per-attempt timeouts.
//! Non-retriable errors (4xx, malformed bodies) return immediately. The
//! caller wraps the whole loop in the call deadline, so the retry budget
//! can never outlive it.

use super::InferenceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry tuning
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub attempts: u32,
    /// Base delay; attempt k backs off within `base * 2^k`
    pub base_delay: Duration,
    /// Ceiling for any single backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), full jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let cap = exp.min(self.max_delay);
        if cap.is_zero() {
            return cap;
        }
        let jittered = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

/// Run `operation` until it succeeds, fails non-retriably, or the
/// attempt budget is spent; returns the last error otherwise.
pub async fn run_with_retry<F, Fut, T>(
    target: &'static str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, InferenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
{
    let mut last_error = InferenceError::Unavailable;

    for attempt in 1..=policy.attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < policy.attempts => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying inference call"
                );
                last_error = e;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}
