//! Registry of per-target circuit breakers.
//!
//! Each target name maps to exactly one [`CircuitBreaker`], created lazily the first time a client
//! invokes that target. The registry lock only guards the map itself; breaker state lives behind
//! each breaker's own mutex, so traffic to unrelated targets never contends.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, Transition};
use crate::clock::{Clock, MonotonicClock};
use crate::config::BreakerConfig;
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No breaker has been created for the target yet.
    #[error("no circuit breaker for target '{target}'")]
    NotFound { target: String },
}

/// Owned map from target name to its breaker.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    /// Breakers created by this registry read time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), clock }
    }

    /// Breaker for `target`, creating it with `config` on first use.
    ///
    /// The first configuration wins; a later caller passing a different one gets the existing
    /// breaker and a warning.
    pub fn breaker(&self, target: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(target) {
            if existing.config() != config {
                warn!(
                    target_name = %target,
                    "circuit breaker already exists with a different config; keeping the original"
                );
            }
            return existing;
        }

        let mut map = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        map.entry(target.to_string())
            .or_insert_with(|| {
                tracing::debug!(target_name = %target, "circuit breaker created");
                Arc::new(CircuitBreaker::with_clock(target, config.clone(), self.clock.clone()))
            })
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        map.get(target).cloned()
    }

    /// Force a target's breaker closed.
    pub fn reset(&self, target: &str) -> Result<Option<Transition>, RegistryError> {
        match self.get(target) {
            Some(breaker) => Ok(breaker.reset()),
            None => Err(RegistryError::NotFound { target: target.to_string() }),
        }
    }

    /// Breaker states sorted by target name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        self.detailed_snapshot().into_iter().map(|(name, snap)| (name, snap.state)).collect()
    }

    /// Full breaker snapshots sorted by target name.
    pub fn detailed_snapshot(&self) -> Vec<(String, BreakerSnapshot)> {
        let breakers: Vec<(String, Arc<CircuitBreaker>)> = {
            let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut entries: Vec<_> =
            breakers.into_iter().map(|(name, breaker)| (name, breaker.snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{Admission, Outcome};
    use crate::clock::ManualClock;
    use crate::log_capture;
    use std::time::Duration;

    fn tight() -> BreakerConfig {
        BreakerConfig::new(1, 1.0, Duration::from_secs(1), 1).unwrap()
    }

    #[test]
    fn breakers_are_created_once_per_target() {
        let registry = BreakerRegistry::new();
        assert!(registry.is_empty());
        let a = registry.breaker("media", &tight());
        let b = registry.breaker("media", &tight());
        let c = registry.breaker("product", &tight());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn targets_are_isolated() {
        let registry = BreakerRegistry::with_clock(Arc::new(ManualClock::new()));
        let media = registry.breaker("media", &tight());
        registry.breaker("product", &tight());
        if let Admission::Granted(p) = media.acquire().0 {
            media.record(p, Outcome::Failure);
        }
        assert_eq!(
            registry.snapshot(),
            vec![("media".to_string(), CircuitState::Open), ("product".to_string(), CircuitState::Closed)]
        );
    }

    #[test]
    fn reset_unknown_target_errors() {
        let registry = BreakerRegistry::new();
        assert_eq!(
            registry.reset("search"),
            Err(RegistryError::NotFound { target: "search".into() })
        );
        registry.breaker("search", &tight());
        assert_eq!(registry.reset("search"), Ok(None));
    }

    #[test]
    fn mismatched_config_warns_and_keeps_original() {
        let (_guard, logs) = log_capture::capture();

        let registry = BreakerRegistry::new();
        let first = registry.breaker("media", &tight());
        let second = registry.breaker("media", &BreakerConfig::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config(), &tight());

        let logs = logs.contents();
        assert_eq!(logs.matches("different config").count(), 1, "expected one warning, got: {logs}");
    }
}
