//! Windowed circuit breaker for one target.
//!
//! State machine:
//! - **Closed**: every call is admitted. Outcomes fill a fixed-size window; once the window is
//!   full and `failures / window_size >= failure_rate_threshold` the breaker opens and the window
//!   is cleared.
//! - **Open**: every call is denied without touching the transport. Once `open_duration` has
//!   elapsed the next admission check moves the breaker to half-open.
//! - **HalfOpen**: at most `half_open_trial_count` trial permits are handed out. Each trial outcome
//!   is judged immediately: one failure reopens the breaker, and the breaker closes once every
//!   trial has reported success.
//!
//! All bookkeeping for a breaker sits behind a single mutex that is never held across an await.
//! Each state change bumps a generation counter; a [`Permit`] remembers the generation it was
//! granted under, and outcomes reported with an outdated permit are ignored. This is how
//! in-flight trial permits are invalidated when one trial fails, and how late outcomes from
//! before a transition stay out of a freshly cleared window.

use crate::clock::{Clock, MonotonicClock};
use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open duration elapses.
    Open,
    /// Probe mode allowing a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one attempt as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, reported so callers can forward it to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Breaker clock reading when the change happened.
    pub at_millis: u64,
}

/// Permission to make one attempt. Must be handed back through [`CircuitBreaker::record`] or
/// [`CircuitBreaker::release`].
#[must_use = "a permit must be reported back to the breaker"]
#[derive(Debug, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    trial: bool,
}

impl Permit {
    /// Whether this permit was granted while half-open.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Answer to an admission request.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Granted(Permit),
    Denied {
        /// Time left until the breaker would admit trial calls (zero when half-open is saturated).
        retry_after: Duration,
    },
}

/// Point-in-time view of a breaker, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub opened_at_millis: Option<u64>,
    pub half_open_permits: usize,
    pub pending_trials: usize,
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    window: VecDeque<Outcome>,
    failures: usize,
    opened_at: u64,
    half_open_permits: usize,
    pending_trials: usize,
    generation: u64,
}

impl CircuitRecord {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(window_size.min(1024)),
            failures: 0,
            opened_at: 0,
            half_open_permits: 0,
            pending_trials: 0,
            generation: 0,
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }

    fn push(&mut self, outcome: Outcome, capacity: usize) {
        self.window.push_back(outcome);
        if outcome == Outcome::Failure {
            self.failures += 1;
        }
        while self.window.len() > capacity {
            if self.window.pop_front() == Some(Outcome::Failure) {
                self.failures -= 1;
            }
        }
    }

    fn move_to(&mut self, to: CircuitState, now: u64, trials: usize) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        match to {
            CircuitState::Open => {
                self.opened_at = now;
                self.half_open_permits = 0;
                self.pending_trials = 0;
                self.clear_window();
            }
            CircuitState::HalfOpen => {
                self.half_open_permits = trials;
                self.pending_trials = trials;
            }
            CircuitState::Closed => {
                self.half_open_permits = 0;
                self.pending_trials = 0;
                self.clear_window();
            }
        }
        Transition { from, to, at_millis: now }
    }
}

/// Circuit breaker guarding a single target.
///
/// Shared between concurrent invocations through an `Arc`; see
/// [`BreakerRegistry`](crate::BreakerRegistry) for the per-target lookup.
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    record: Mutex<CircuitRecord>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker using the monotonic clock.
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(target, config, Arc::new(MonotonicClock::default()))
    }

    /// Create a closed breaker driven by the given clock.
    pub fn with_clock(
        target: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let record = Mutex::new(CircuitRecord::new(config.window_size()));
        Self { target: target.into(), config, clock, record }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state without evaluating the open timer.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let record = self.lock();
        BreakerSnapshot {
            state: record.state,
            window_len: record.window.len(),
            window_failures: record.failures,
            opened_at_millis: (record.state == CircuitState::Open).then_some(record.opened_at),
            half_open_permits: record.half_open_permits,
            pending_trials: record.pending_trials,
        }
    }

    /// Ask for permission to make one attempt.
    ///
    /// May move an open breaker to half-open when its timer has run out; the transition is
    /// returned alongside the admission.
    pub fn acquire(&self) -> (Admission, Option<Transition>) {
        let mut record = self.lock();
        let now = self.clock.now_millis();
        let mut transition = None;

        if record.state == CircuitState::Open {
            let elapsed = now.saturating_sub(record.opened_at);
            let wait = duration_millis(self.config.open_duration());
            if elapsed < wait {
                return (
                    Admission::Denied { retry_after: Duration::from_millis(wait - elapsed) },
                    None,
                );
            }
            transition = Some(record.move_to(
                CircuitState::HalfOpen,
                now,
                self.config.half_open_trial_count(),
            ));
        }

        let admission = match record.state {
            CircuitState::Closed => {
                Admission::Granted(Permit { generation: record.generation, trial: false })
            }
            CircuitState::HalfOpen if record.half_open_permits > 0 => {
                record.half_open_permits -= 1;
                tracing::debug!(
                    target_name = %self.target,
                    remaining = record.half_open_permits,
                    "circuit breaker: half-open trial admitted"
                );
                Admission::Granted(Permit { generation: record.generation, trial: true })
            }
            _ => Admission::Denied { retry_after: Duration::ZERO },
        };
        drop(record);

        if let Some(t) = &transition {
            self.log_transition(t);
        }
        (admission, transition)
    }

    /// Report the outcome of an admitted attempt.
    pub fn record(&self, permit: Permit, outcome: Outcome) -> Option<Transition> {
        let mut record = self.lock();
        if permit.generation != record.generation {
            tracing::debug!(
                target_name = %self.target,
                outcome = outcome.as_str(),
                "circuit breaker: outcome from an earlier state ignored"
            );
            return None;
        }

        let now = self.clock.now_millis();
        let trials = self.config.half_open_trial_count();
        let transition = match (record.state, outcome) {
            (CircuitState::Closed, _) => {
                let capacity = self.config.window_size();
                record.push(outcome, capacity);
                let rate = record.failures as f64 / capacity as f64;
                if record.window.len() == capacity && rate >= self.config.failure_rate_threshold() {
                    Some(record.move_to(CircuitState::Open, now, trials))
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                Some(record.move_to(CircuitState::Open, now, trials))
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                record.pending_trials = record.pending_trials.saturating_sub(1);
                if record.pending_trials == 0 {
                    Some(record.move_to(CircuitState::Closed, now, trials))
                } else {
                    None
                }
            }
            (CircuitState::Open, _) => None,
        };
        drop(record);

        if let Some(t) = &transition {
            self.log_transition(t);
        }
        transition
    }

    /// Hand back a permit without an outcome. A half-open trial slot becomes available again.
    pub fn release(&self, permit: Permit) {
        let mut record = self.lock();
        if permit.trial
            && permit.generation == record.generation
            && record.state == CircuitState::HalfOpen
        {
            record.half_open_permits =
                (record.half_open_permits + 1).min(self.config.half_open_trial_count());
        }
    }

    /// Force the breaker closed with an empty window. Outstanding permits become stale.
    pub fn reset(&self) -> Option<Transition> {
        let mut record = self.lock();
        let now = self.clock.now_millis();
        let from = record.state;
        let transition =
            record.move_to(CircuitState::Closed, now, self.config.half_open_trial_count());
        drop(record);

        if from == CircuitState::Closed {
            return None;
        }
        self.log_transition(&transition);
        Some(transition)
    }

    fn lock(&self) -> MutexGuard<'_, CircuitRecord> {
        // Every mutation completes before user code runs, so a poisoned record is still consistent.
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_transition(&self, t: &Transition) {
        match (t.from, t.to) {
            (CircuitState::Closed, CircuitState::Open) => tracing::error!(
                target_name = %self.target,
                window = self.config.window_size(),
                threshold = self.config.failure_rate_threshold(),
                "circuit breaker → open"
            ),
            (CircuitState::HalfOpen, CircuitState::Open) => tracing::warn!(
                target_name = %self.target,
                "circuit breaker: trial failed → open"
            ),
            (from, to) => tracing::info!(
                target_name = %self.target,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker transition"
            ),
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
