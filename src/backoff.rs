//! Deterministic backoff between attempts of one invocation.
//!
//! Attempt semantics: attempt `0` is the initial call and never waits; the delay before retry `n`
//! is `delay(n)`. Every strategy is monotonically non-decreasing in `n` and a pure function of it,
//! so two invocations with the same configuration always wait the same amounts.
//!
//! ```rust
//! use std::time::Duration;
//! use peercall::Backoff;
//!
//! let backoff = Backoff::sequence(vec![
//!     Duration::from_millis(100),
//!     Duration::from_millis(250),
//! ])
//! .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(250));
//! assert_eq!(backoff.delay(7), Duration::from_millis(250)); // last step repeats
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`].

use std::time::Duration;

/// Upper bound for any computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    MaxNotSupported,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("backoff sequence must not be empty")]
    EmptySequence,
    #[error("backoff sequence must be non-decreasing (step {index} is {delay:?}, previous {previous:?})")]
    Decreasing { index: usize, previous: Duration, delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    Constant(Duration),
    Linear { base: Duration, max: Option<Duration> },
    Exponential { base: Duration, max: Option<Duration> },
    Sequence(Vec<Duration>),
}

/// Backoff strategy used by [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    strategy: Strategy,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { strategy: Strategy::Constant(delay) }
    }

    /// `base * n` before retry `n`.
    pub fn linear(base: Duration) -> Self {
        Self { strategy: Strategy::Linear { base, max: None } }
    }

    /// `base * 2^(n-1)` before retry `n`.
    pub fn exponential(base: Duration) -> Self {
        Self { strategy: Strategy::Exponential { base, max: None } }
    }

    /// Explicit delays: step `n - 1` before retry `n`, the last step repeating afterwards.
    pub fn sequence(steps: Vec<Duration>) -> Result<Self, BackoffError> {
        if steps.is_empty() {
            return Err(BackoffError::EmptySequence);
        }
        for (index, pair) in steps.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(BackoffError::Decreasing {
                    index: index + 1,
                    previous: pair[0],
                    delay: pair[1],
                });
            }
        }
        Ok(Self { strategy: Strategy::Sequence(steps) })
    }

    /// Cap a linear or exponential backoff.
    pub fn with_max(mut self, cap: Duration) -> Result<Self, BackoffError> {
        if cap.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.strategy {
            Strategy::Linear { base, max } | Strategy::Exponential { base, max } => {
                if cap < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max: cap });
                }
                *max = Some(cap);
                Ok(self)
            }
            Strategy::Constant(_) | Strategy::Sequence(_) => Err(BackoffError::MaxNotSupported),
        }
    }

    /// Delay before the given attempt (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match &self.strategy {
            Strategy::Constant(delay) => *delay,
            Strategy::Linear { base, max } => {
                let factor = attempt.min(u32::MAX as usize) as u32;
                let linear = base.checked_mul(factor).unwrap_or(MAX_BACKOFF);
                max.map_or(linear, |m| linear.min(m))
            }
            Strategy::Exponential { base, max } => {
                let exponent = (attempt - 1).min(u32::MAX as usize) as u32;
                let nanos = base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let grown = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(grown, |m| grown.min(m))
            }
            Strategy::Sequence(steps) => {
                let idx = (attempt - 1).min(steps.len() - 1);
                steps[idx]
            }
        };
        raw.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::constant(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn overflow_saturates() {
        let exp = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(exp.delay(1_000_000_000), MAX_BACKOFF);
        let linear = Backoff::linear(Duration::from_secs(u64::MAX / 2));
        assert_eq!(linear.delay(1_000_000_000), MAX_BACKOFF);
    }

    #[test]
    fn sequence_repeats_last_step() {
        let backoff = Backoff::sequence(vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ])
        .unwrap();
        let delays: Vec<_> = (0..6).map(|n| backoff.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
    }

    #[test]
    fn sequence_rejects_decreasing_steps() {
        let err = Backoff::sequence(vec![Duration::from_millis(50), Duration::from_millis(10)])
            .unwrap_err();
        assert!(matches!(err, BackoffError::Decreasing { index: 1, .. }));
        assert_eq!(Backoff::sequence(vec![]).unwrap_err(), BackoffError::EmptySequence);
    }

    #[test]
    fn with_max_validation() {
        assert_eq!(
            Backoff::constant(Duration::from_secs(5)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxNotSupported)
        );
        assert!(matches!(
            Backoff::linear(Duration::from_secs(100)).with_max(Duration::from_secs(50)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert_eq!(
            Backoff::linear(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
    }

    #[test]
    fn every_strategy_is_non_decreasing() {
        let strategies = [
            Backoff::constant(Duration::from_millis(7)),
            Backoff::linear(Duration::from_millis(7)).with_max(Duration::from_millis(30)).unwrap(),
            Backoff::exponential(Duration::from_millis(7)),
            Backoff::sequence(vec![Duration::from_millis(1), Duration::from_millis(9)]).unwrap(),
        ];
        for backoff in strategies {
            let delays: Vec<_> = (0..20).map(|n| backoff.delay(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{backoff:?} decreased");
        }
    }
}
