//! Failure taxonomy for resilient calls.
//!
//! Three layers of failure exist:
//! - [`TransportFailure`]: what a single attempt through the transport produced, classified by
//!   [`FailureKind`].
//! - [`CallFailure`]: why an invocation ended up at its fallback. Handed to the fallback so it can
//!   choose between a substitute value and re-raising.
//! - [`ClientError`]: the only errors that escape [`ServiceClient::invoke`](crate::ServiceClient::invoke).
use std::time::Duration;

/// Boxed error used for fallback faults and transport adapters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network errors, timeouts and the designated set of server-side statuses. Retryable.
    Transient,
    /// The peer rejected the request (malformed, not found, validation). Never retried.
    ClientError,
    /// Anything the transport could not classify. Not retried.
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::ClientError => write!(f, "client-error"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Statuses treated as transient by [`TransportFailure::from_status`].
pub const TRANSIENT_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Failure of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} failure{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct TransportFailure {
    kind: FailureKind,
    status: Option<u16>,
    message: String,
}

impl TransportFailure {
    /// Network-level or otherwise retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Transient, status: None, message: message.into() }
    }

    /// The peer rejected the request.
    pub fn client_error(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::ClientError, status: None, message: message.into() }
    }

    /// Unclassified failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Unknown, status: None, message: message.into() }
    }

    /// The attempt did not finish within its per-attempt budget.
    pub fn timeout(limit: Duration) -> Self {
        Self::transient(format!("attempt timed out after {limit:?}"))
    }

    /// Classify an HTTP-style status code.
    ///
    /// Statuses in [`TRANSIENT_STATUSES`] are transient, any other 4xx is a client error, and
    /// everything else is unknown.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if TRANSIENT_STATUSES.contains(&status) {
            FailureKind::Transient
        } else if (400..500).contains(&status) {
            FailureKind::ClientError
        } else {
            FailureKind::Unknown
        };
        Self { kind, status: Some(status), message: message.into() }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    pub fn is_client_error(&self) -> bool {
        self.kind == FailureKind::ClientError
    }
}

/// Why an invocation was routed to its fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallFailure {
    /// The breaker for the target denied the call; the transport was not touched.
    #[error("circuit for '{target}' is open (retry after {retry_after:?})")]
    CircuitOpen {
        /// Target whose breaker denied the call.
        target: String,
        /// Time left before the breaker admits trial calls.
        retry_after: Duration,
    },
    /// The peer rejected the request; not retried.
    #[error("request rejected: {0}")]
    ClientRequest(TransportFailure),
    /// Every permitted attempt failed transiently.
    #[error("retries exhausted after {attempts} attempts; last error: {last}")]
    ExhaustedRetries {
        /// Attempts made, including the first.
        attempts: usize,
        /// Failure of the final attempt.
        last: TransportFailure,
    },
    /// A non-retryable failure that is not a client error.
    #[error("unclassified failure: {0}")]
    Unclassified(TransportFailure),
    /// The retry predicate declined a transient failure before the budget was spent.
    #[error("not retried after attempt {attempts}: {last}")]
    NotRetried {
        /// Attempts made, including the first.
        attempts: usize,
        /// Failure the predicate declined.
        last: TransportFailure,
    },
}

impl CallFailure {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::ExhaustedRetries { .. })
    }

    /// Transport failure behind this call failure, if any attempt was made.
    pub fn transport_failure(&self) -> Option<&TransportFailure> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::ClientRequest(f) | Self::Unclassified(f) => Some(f),
            Self::ExhaustedRetries { last, .. } | Self::NotRetried { last, .. } => Some(last),
        }
    }

    /// Short machine-friendly label, used in telemetry.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ClientRequest(_) => "client_request",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::Unclassified(_) => "unclassified",
            Self::NotRetried { .. } => "not_retried",
        }
    }
}

/// Errors that escape [`ServiceClient::invoke`](crate::ServiceClient::invoke).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No fallback is bound for the operation. A configuration defect.
    #[error("no fallback registered for {target}.{operation} (cause: {cause})")]
    UnregisteredFallback {
        target: String,
        operation: String,
        cause: CallFailure,
    },
    /// The fallback itself faulted, or deliberately re-raised.
    #[error("fallback for {target}.{operation} failed (cause: {cause})")]
    FallbackFailed {
        target: String,
        operation: String,
        cause: CallFailure,
        #[source]
        source: BoxError,
    },
}

impl ClientError {
    /// The failure that triggered fallback resolution.
    pub fn cause(&self) -> &CallFailure {
        match self {
            Self::UnregisteredFallback { cause, .. } | Self::FallbackFailed { cause, .. } => cause,
        }
    }

    pub fn is_unregistered(&self) -> bool {
        matches!(self, Self::UnregisteredFallback { .. })
    }

    pub fn is_fallback_failure(&self) -> bool {
        matches!(self, Self::FallbackFailed { .. })
    }
}

/// Invalid configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("window_size must be > 0 (got {0})")]
    InvalidWindowSize(usize),
    #[error("failure_rate_threshold must be in (0, 1] (got {0})")]
    InvalidFailureRate(f64),
    #[error("open_duration must be > 0 (got {0:?})")]
    InvalidOpenDuration(Duration),
    #[error("half_open_trial_count must be > 0 (got {0})")]
    InvalidHalfOpenTrials(usize),
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("attempt_timeout must be > 0 (got {0:?})")]
    InvalidAttemptTimeout(Duration),
    #[error("backoff_ms and backoff are mutually exclusive")]
    ConflictingBackoff,
    #[error("base_url must not be empty")]
    EmptyBaseUrl,
    #[error("invalid backoff: {0}")]
    Backoff(#[from] crate::backoff::BackoffError),
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot read configuration file {}: {source}", .path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while binding fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A fallback is already bound for the pair; bindings are immutable.
    #[error("fallback already registered for {target}.{operation}")]
    Duplicate { target: String, operation: String },
}
