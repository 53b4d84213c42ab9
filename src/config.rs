//! Per-target configuration.
//!
//! Every value is validated on construction, so a [`ServiceClient`](crate::ServiceClient) never
//! sees an impossible window or a zero attempt budget. Configuration can be built in code or read
//! from JSON:
//!
//! ```rust
//! use peercall::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::from_json_str(r#"{
//!     "defaults": { "max_attempts": 3, "backoff_ms": [100, 200] },
//!     "targets": {
//!         "media": { "window_size": 20, "open_duration_ms": 5000, "base_url": "http://media:8080" }
//!     }
//! }"#).unwrap();
//!
//! let media = config.for_target("media");
//! assert_eq!(media.breaker.window_size(), 20);
//! assert_eq!(media.breaker.open_duration(), Duration::from_secs(5));
//! assert_eq!(media.retry.max_attempts(), 3);
//! assert_eq!(media.base_url(), Some("http://media:8080"));
//! ```

use crate::backoff::Backoff;
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Circuit breaker settings for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    window_size: usize,
    failure_rate_threshold: f64,
    open_duration: Duration,
    half_open_trial_count: usize,
    count_client_errors: bool,
}

impl BreakerConfig {
    /// Create a validated breaker config. Client-request failures count as failures.
    pub fn new(
        window_size: usize,
        failure_rate_threshold: f64,
        open_duration: Duration,
        half_open_trial_count: usize,
    ) -> Result<Self, ConfigError> {
        let cfg = Self {
            window_size,
            failure_rate_threshold,
            open_duration,
            half_open_trial_count,
            count_client_errors: true,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Whether client-request failures (not-found, validation) count against the failure rate.
    ///
    /// When `false` such outcomes are left out of the window entirely.
    pub fn with_client_errors_counted(mut self, counted: bool) -> Self {
        self.count_client_errors = counted;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::InvalidWindowSize(self.window_size));
        }
        let rate = self.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::InvalidFailureRate(rate));
        }
        if self.open_duration.is_zero() {
            return Err(ConfigError::InvalidOpenDuration(self.open_duration));
        }
        if self.half_open_trial_count == 0 {
            return Err(ConfigError::InvalidHalfOpenTrials(self.half_open_trial_count));
        }
        Ok(())
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    pub fn open_duration(&self) -> Duration {
        self.open_duration
    }

    pub fn half_open_trial_count(&self) -> usize {
        self.half_open_trial_count
    }

    pub fn counts_client_errors(&self) -> bool {
        self.count_client_errors
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(60),
            half_open_trial_count: 10,
            count_client_errors: true,
        }
    }
}

/// Retry settings for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: usize,
    backoff: Backoff,
    attempt_timeout: Duration,
}

impl RetryConfig {
    /// `max_attempts` includes the first attempt.
    pub fn new(
        max_attempts: usize,
        backoff: Backoff,
        attempt_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(max_attempts));
        }
        if attempt_timeout.is_zero() {
            return Err(ConfigError::InvalidAttemptTimeout(attempt_timeout));
        }
        Ok(Self { max_attempts, backoff, attempt_timeout })
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

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a client needs to know about one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    /// Where the target lives, e.g. `http://media:8080/media`. Handed to transports as-is.
    pub base_url: Option<String>,
}

impl TargetConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }
}

/// Defaults plus per-target overrides, keyed by target name.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    defaults: TargetConfig,
    targets: HashMap<String, TargetConfig>,
}

impl ClientConfig {
    pub fn new(defaults: TargetConfig) -> Self {
        Self { defaults, targets: HashMap::new() }
    }

    /// Override the configuration of one target.
    pub fn with_target(mut self, name: impl Into<String>, config: TargetConfig) -> Self {
        self.targets.insert(name.into(), config);
        self
    }

    /// Configuration for `name`, falling back to the defaults.
    pub fn for_target(&self, name: &str) -> TargetConfig {
        self.targets.get(name).cloned().unwrap_or_else(|| self.defaults.clone())
    }

    pub fn defaults(&self) -> &TargetConfig {
        &self.defaults
    }

    /// Parse and validate a JSON document. Target entries only need the fields they override.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawClientConfig = serde_json::from_str(json)?;
        let defaults = raw.defaults.apply(&TargetConfig::default())?;
        let mut targets = HashMap::with_capacity(raw.targets.len());
        for (name, entry) in raw.targets {
            let resolved = entry.apply(&defaults)?;
            targets.insert(name, resolved);
        }
        Ok(Self { defaults, targets })
    }

    /// Read and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), targets = config.targets.len(), "client config loaded");
        Ok(config)
    }

    /// Names of targets with explicit overrides, sorted.
    pub fn target_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawClientConfig {
    #[serde(default)]
    defaults: RawTargetConfig,
    #[serde(default)]
    targets: HashMap<String, RawTargetConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTargetConfig {
    window_size: Option<usize>,
    failure_rate_threshold: Option<f64>,
    open_duration_ms: Option<u64>,
    half_open_trial_count: Option<usize>,
    count_client_errors: Option<bool>,
    max_attempts: Option<usize>,
    backoff_ms: Option<Vec<u64>>,
    backoff: Option<RawBackoff>,
    attempt_timeout_ms: Option<u64>,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum RawBackoff {
    Constant { delay_ms: u64 },
    Linear { base_ms: u64, max_ms: Option<u64> },
    Exponential { base_ms: u64, max_ms: Option<u64> },
}

impl RawBackoff {
    fn resolve(&self) -> Result<Backoff, ConfigError> {
        let capped = |backoff: Backoff, max_ms: Option<u64>| match max_ms {
            Some(ms) => backoff.with_max(Duration::from_millis(ms)),
            None => Ok(backoff),
        };
        let backoff = match *self {
            RawBackoff::Constant { delay_ms } => Backoff::constant(Duration::from_millis(delay_ms)),
            RawBackoff::Linear { base_ms, max_ms } => {
                capped(Backoff::linear(Duration::from_millis(base_ms)), max_ms)?
            }
            RawBackoff::Exponential { base_ms, max_ms } => {
                capped(Backoff::exponential(Duration::from_millis(base_ms)), max_ms)?
            }
        };
        Ok(backoff)
    }
}

impl RawTargetConfig {
    fn apply(&self, base: &TargetConfig) -> Result<TargetConfig, ConfigError> {
        let b = &base.breaker;
        let breaker = BreakerConfig::new(
            self.window_size.unwrap_or(b.window_size),
            self.failure_rate_threshold.unwrap_or(b.failure_rate_threshold),
            self.open_duration_ms.map(Duration::from_millis).unwrap_or(b.open_duration),
            self.half_open_trial_count.unwrap_or(b.half_open_trial_count),
        )?
        .with_client_errors_counted(self.count_client_errors.unwrap_or(b.count_client_errors));

        let backoff = match (&self.backoff_ms, &self.backoff) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingBackoff),
            (Some(steps), None) => {
                Backoff::sequence(steps.iter().copied().map(Duration::from_millis).collect())?
            }
            (None, Some(raw)) => raw.resolve()?,
            (None, None) => base.retry.backoff.clone(),
        };
        let retry = RetryConfig::new(
            self.max_attempts.unwrap_or(base.retry.max_attempts),
            backoff,
            self.attempt_timeout_ms.map(Duration::from_millis).unwrap_or(base.retry.attempt_timeout),
        )?;

        let base_url = match &self.base_url {
            Some(url) if url.trim().is_empty() => return Err(ConfigError::EmptyBaseUrl),
            Some(url) => Some(url.trim_end_matches('/').to_string()),
            None => base.base_url.clone(),
        };

        Ok(TargetConfig { breaker, retry, base_url })
    }
}
