//! Per-collaborator circuit breaker
//!
//! Rolling-window failure-rate breaker: while closed, the last N call
//! outcomes are tracked; once the window holds at least `min_calls`
//! outcomes and the failure share reaches the threshold, the breaker
//! opens and calls fail fast until the cooldown passes. Half-open admits
//! exactly one probe: success closes the breaker, failure re-opens it.
//!
//! Shared across all pipeline workers; the critical section is a short
//! mutex around the state enum.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker tuning
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Rolling window length in calls
    pub window: usize,
    /// Minimum outcomes in the window before the rate is judged
    pub min_calls: usize,
    /// Failure share that opens the breaker (0.0 to 1.0)
    pub failure_rate: f64,
    /// Time spent open before a probe is admitted
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_calls: 5,
            failure_rate: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { outcomes: VecDeque<bool> },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Admission decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the call and report the outcome
    Allowed,
    /// Fail fast; the collaborator is considered down
    Denied,
}

/// Circuit breaker guarding one collaborator
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(State::Closed {
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Decide whether a call may proceed right now
    pub fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Admission::Allowed,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    tracing::info!(target = self.name, "Breaker half-open, admitting probe");
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Admission::Allowed
                } else {
                    Admission::Denied
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Admission::Denied
                } else {
                    *probe_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Report a successful call
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                Self::push_outcome(outcomes, self.config.window, true);
            }
            State::HalfOpen { .. } => {
                tracing::info!(target = self.name, "Probe succeeded, breaker closed");
                *state = State::Closed {
                    outcomes: VecDeque::new(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Report a failed call
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { outcomes } => {
                Self::push_outcome(outcomes, self.config.window, false);
                let total = outcomes.len();
                let failures = outcomes.iter().filter(|ok| !**ok).count();
                if total >= self.config.min_calls
                    && failures as f64 / total as f64 >= self.config.failure_rate
                {
                    tracing::warn!(
                        target = self.name,
                        failures,
                        total,
                        "Failure rate exceeded, breaker open"
                    );
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            State::HalfOpen { .. } => {
                tracing::warn!(target = self.name, "Probe failed, breaker re-open");
                *state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Whether the breaker currently fails fast
    pub fn is_open(&self) -> bool {
        matches!(&*self.state.lock(), State::Open { .. })
    }

    fn push_outcome(outcomes: &mut VecDeque<bool>, window: usize, ok: bool) {
        if outcomes.len() == window {
            outcomes.pop_front();
        }
        outcomes.push_back(ok);
    }
}
