//! Retry policy for one target.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only transient failures are retried by default; client-request and unclassified failures are
//!   terminal on the first attempt. The predicate can be replaced with
//!   [`RetryPolicyBuilder::should_retry`].
//! - The delay before retry `n` is `backoff.delay(n)`, a pure function of `n`.
//! - Waiting goes through a [`Sleeper`], so tests can record the schedule instead of sleeping.
//!
//! The policy itself is stateless; per-invocation progress lives in a [`RetryContext`].
//!
//! ```rust
//! use std::time::Duration;
//! use peercall::{Backoff, RetryContext, RetryDecision, RetryPolicy, TransportFailure};
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::linear(Duration::from_millis(100)))
//!     .build()
//!     .unwrap();
//!
//! let mut ctx = policy.context();
//! ctx.begin_attempt();
//! let failure = TransportFailure::transient("connection reset");
//! ctx.record_failure(&failure);
//! assert_eq!(
//!     policy.decide(&failure, &ctx),
//!     RetryDecision::Retry { delay: Duration::from_millis(100) }
//! );
//! ```

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::{ConfigError, FailureKind, TransportFailure};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::Duration;

/// Progress of one invocation. Created fresh per call and never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    attempt: usize,
    max_attempts: usize,
    last_failure: Option<FailureKind>,
}

impl RetryContext {
    pub fn new(max_attempts: usize) -> Self {
        Self { attempt: 0, max_attempts, last_failure: None }
    }

    /// Mark the start of the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> usize {
        self.attempt += 1;
        self.attempt
    }

    pub fn record_failure(&mut self, failure: &TransportFailure) {
        self.last_failure = Some(failure.kind());
    }

    /// Attempts started so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        self.last_failure
    }
}

/// Why the retry loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The failure is not eligible for retry.
    NotRetryable,
    /// The attempt budget is spent.
    Exhausted,
}

/// Verdict for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Stop(StopReason),
}

type RetryPredicate = Arc<dyn Fn(&TransportFailure) -> bool + Send + Sync>;

/// Retry policy combining attempt budget, backoff, predicate, per-attempt timeout and sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    attempt_timeout: Duration,
    should_retry: RetryPredicate,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Policy for an already validated config, using the default predicate and tokio sleeper.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            backoff: config.backoff().clone(),
            attempt_timeout: config.attempt_timeout(),
            should_retry: Arc::new(TransportFailure::is_transient),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Fresh context for one invocation.
    pub fn context(&self) -> RetryContext {
        RetryContext::new(self.max_attempts)
    }

    /// Decide what to do after `failure` ended attempt `ctx.attempt()`.
    pub fn decide(&self, failure: &TransportFailure, ctx: &RetryContext) -> RetryDecision {
        if !(self.should_retry)(failure) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if ctx.attempt() >= self.max_attempts {
            return RetryDecision::Stop(StopReason::Exhausted);
        }
        RetryDecision::Retry { delay: self.backoff.delay(ctx.attempt()) }
    }

    pub(crate) fn set_sleeper(&mut self, sleeper: Arc<dyn Sleeper>) {
        self.sleeper = sleeper;
    }

    /// Wait before the next attempt.
    pub async fn pause(&self, delay: Duration) {
        self.sleeper.sleep(delay).await;
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    attempt_timeout: Duration,
    should_retry: RetryPredicate,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    /// Builder seeded with the defaults of [`RetryConfig`].
    pub fn new() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    /// Builder seeded from a validated config.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            backoff: config.backoff().clone(),
            attempt_timeout: config.attempt_timeout(),
            should_retry: Arc::new(TransportFailure::is_transient),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Budget for a single transport attempt. Must be > 0.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Replace the retry predicate.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TransportFailure) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        // validates max_attempts and attempt_timeout
        RetryConfig::new(self.max_attempts, self.backoff.clone(), self.attempt_timeout)?;
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            attempt_timeout: self.attempt_timeout,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
