//! The service client facade: the only entry point callers use.
//!
//! A [`ServiceClient`] is bound to one target and composes its pieces explicitly:
//!
//! ```text
//! invoke(op, args)
//!   └─ loop
//!        ├─ breaker.acquire()          denied  → fallback(CircuitOpen)
//!        ├─ transport.perform(..)      under the per-attempt timeout
//!        ├─ breaker.record(outcome)    after every attempt, not only the last
//!        └─ retry.decide(..)           retry → pause(backoff) ; stop → fallback(cause)
//! ```
//!
//! Expected failure paths never escape: the caller gets the remote value, a fallback value, or
//! one of the two [`ClientError`] kinds when no safe substitute exists.
//!
//! Dropping an `invoke` future while an attempt is in flight aborts the transport call and
//! reports that attempt to the breaker as a failure. Dropping it between attempts records
//! nothing.
//!
//! ```rust
//! use peercall::{fallback, ServiceClient, TowerTransport, TransportFailure, TransportRequest};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let transport = TowerTransport::new(tower::service_fn(|req: TransportRequest<u64>| async move {
//!     Ok::<_, TransportFailure>(format!("media-{}", req.args))
//! }));
//! let client = ServiceClient::builder("media", transport)
//!     .fallback("get_media", fallback::value(String::from("placeholder")))
//!     .build()
//!     .unwrap();
//!
//! let reply = client.invoke("get_media", &7).await.unwrap();
//! assert_eq!(reply.into_inner(), "media-7");
//! # }
//! ```

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState, Outcome, Permit, Transition};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ClientConfig, TargetConfig};
use crate::error::{BoxError, CallFailure, ClientError, FailureKind, RegistrationError, TransportFailure};
use crate::fallback::{Fallback, FallbackTable};
use crate::registry::BreakerRegistry;
use crate::retry::{RetryDecision, RetryPolicy, StopReason};
use crate::sleeper::Sleeper;
use crate::telemetry::{ClientEvent, ClientEventKind, Emitter, TelemetrySink};
use crate::transport::Transport;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What `invoke` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// The remote operation succeeded.
    Remote(T),
    /// The fallback supplied `value` because of `cause`.
    Fallback { value: T, cause: CallFailure },
}

impl<T> Reply<T> {
    pub fn into_inner(self) -> T {
        match self {
            Reply::Remote(value) | Reply::Fallback { value, .. } => value,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Reply::Remote(value) | Reply::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Reply::Fallback { .. })
    }

    /// Failure that led to the fallback, if one was used.
    pub fn cause(&self) -> Option<&CallFailure> {
        match self {
            Reply::Remote(_) => None,
            Reply::Fallback { cause, .. } => Some(cause),
        }
    }
}

/// Resilient client for one target.
pub struct ServiceClient<T: Transport> {
    target: String,
    transport: Arc<T>,
    registry: Arc<BreakerRegistry>,
    breaker: Arc<OnceLock<Arc<CircuitBreaker>>>,
    config: TargetConfig,
    retry: RetryPolicy,
    fallbacks: Arc<FallbackTable<T::Request, T::Response>>,
    emitter: Emitter,
}

impl<T: Transport> Clone for ServiceClient<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            breaker: self.breaker.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
            fallbacks: self.fallbacks.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for ServiceClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl<T: Transport> ServiceClient<T> {
    pub fn builder(target: impl Into<String>, transport: T) -> ServiceClientBuilder<T> {
        ServiceClientBuilder::new(target, transport)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Breaker for this client's target, created on first use.
    ///
    /// The registry is consulted once per client (clones included); later calls reuse the handle.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker
            .get_or_init(|| self.registry.breaker(&self.target, &self.config.breaker))
            .clone()
    }

    pub fn state(&self) -> CircuitState {
        self.breaker().state()
    }

    /// Run `operation` against the target with breaker gating, retries and fallback.
    pub async fn invoke(
        &self,
        operation: &str,
        args: &T::Request,
    ) -> Result<Reply<T::Response>, ClientError> {
        let breaker = self.breaker();
        let timeout = self.retry.attempt_timeout();
        let mut ctx = self.retry.context();

        let failure = loop {
            let (admission, transition) = breaker.acquire();
            let permit = match admission {
                Admission::Granted(permit) => permit,
                Admission::Denied { retry_after } => {
                    self.emit_transition(transition).await;
                    debug!(
                        target_name = %self.target,
                        operation = %operation,
                        attempt = ctx.attempt() + 1,
                        ?retry_after,
                        "call denied by circuit breaker"
                    );
                    self.emit(ClientEventKind::PermissionDenied { retry_after }).await;
                    break CallFailure::CircuitOpen { target: self.target.clone(), retry_after };
                }
            };

            // The guard must own the permit before the next await point.
            let attempt = ctx.begin_attempt();
            let guard = AttemptGuard {
                breaker: &breaker,
                permit: Some(permit),
                emitter: &self.emitter,
                target: &self.target,
                operation,
                attempt,
                started: Instant::now(),
            };
            self.emit_transition(transition).await;

            let result =
                match tokio::time::timeout(timeout, self.transport.perform(operation, args, timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportFailure::timeout(timeout)),
                };
            let duration = guard.started.elapsed();

            let failure = match result {
                Ok(response) => {
                    let transition = guard.complete(Outcome::Success);
                    self.emit_attempt(operation, attempt, Outcome::Success, duration).await;
                    self.emit_transition(transition).await;
                    return Ok(Reply::Remote(response));
                }
                Err(failure) => failure,
            };

            let counted = !failure.is_client_error() || self.config.breaker.counts_client_errors();
            let transition = if counted {
                guard.complete(Outcome::Failure)
            } else {
                guard.release();
                None
            };
            debug!(
                target_name = %self.target,
                operation = %operation,
                attempt,
                error = %failure,
                counted,
                "attempt failed"
            );
            self.emit_attempt(operation, attempt, Outcome::Failure, duration).await;
            self.emit_transition(transition).await;

            ctx.record_failure(&failure);
            match self.retry.decide(&failure, &ctx) {
                RetryDecision::Retry { delay } => {
                    debug!(
                        target_name = %self.target,
                        operation = %operation,
                        attempt,
                        ?delay,
                        "retry scheduled"
                    );
                    self.emit(ClientEventKind::RetryScheduled {
                        operation: operation.to_string(),
                        attempt,
                        delay,
                    })
                    .await;
                    self.retry.pause(delay).await;
                }
                RetryDecision::Stop(StopReason::Exhausted) => {
                    break CallFailure::ExhaustedRetries { attempts: attempt, last: failure };
                }
                RetryDecision::Stop(StopReason::NotRetryable) => {
                    break match failure.kind() {
                        FailureKind::ClientError => CallFailure::ClientRequest(failure),
                        FailureKind::Unknown => CallFailure::Unclassified(failure),
                        FailureKind::Transient => {
                            CallFailure::NotRetried { attempts: attempt, last: failure }
                        }
                    };
                }
            }
        };

        info!(
            target_name = %self.target,
            operation = %operation,
            cause = %failure,
            "routing call to fallback"
        );
        self.emit(ClientEventKind::FallbackInvoked {
            operation: operation.to_string(),
            cause: failure.label(),
        })
        .await;
        match self.fallbacks.resolve(&self.target, operation, &failure, args) {
            Ok(value) => Ok(Reply::Fallback { value, cause: failure }),
            Err(err) => {
                self.emit(ClientEventKind::FallbackFailed { operation: operation.to_string() })
                    .await;
                Err(err)
            }
        }
    }

    async fn emit(&self, kind: ClientEventKind) {
        self.emitter.emit(ClientEvent::new(self.target.as_str(), kind)).await;
    }

    async fn emit_transition(&self, transition: Option<Transition>) {
        if let Some(t) = transition {
            self.emitter.emit(ClientEvent::transition(&self.target, &t)).await;
        }
    }

    async fn emit_attempt(
        &self,
        operation: &str,
        attempt: usize,
        outcome: Outcome,
        duration: std::time::Duration,
    ) {
        self.emit(ClientEventKind::AttemptOutcome {
            operation: operation.to_string(),
            attempt,
            outcome,
            duration,
        })
        .await;
    }
}

/// Owns the permit of an in-flight attempt. Dropped unreported, it records a failure.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
    emitter: &'a Emitter,
    target: &'a str,
    operation: &'a str,
    attempt: usize,
    started: Instant,
}

impl AttemptGuard<'_> {
    fn complete(mut self, outcome: Outcome) -> Option<Transition> {
        let permit = self.permit.take()?;
        self.breaker.record(permit, outcome)
    }

    fn release(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release(permit);
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        warn!(
            target_name = %self.target,
            operation = %self.operation,
            attempt = self.attempt,
            "attempt cancelled in flight; counted as failure"
        );
        let transition = self.breaker.record(permit, Outcome::Failure);
        self.emitter.emit_detached(ClientEvent::new(
            self.target,
            ClientEventKind::AttemptOutcome {
                operation: self.operation.to_string(),
                attempt: self.attempt,
                outcome: Outcome::Failure,
                duration: self.started.elapsed(),
            },
        ));
        if let Some(t) = transition {
            self.emitter.emit_detached(ClientEvent::transition(self.target, &t));
        }
    }
}

/// Builder for [`ServiceClient`]. Fallbacks are bound here and cannot change afterwards.
pub struct ServiceClientBuilder<T: Transport> {
    target: String,
    transport: T,
    config: TargetConfig,
    retry: Option<RetryPolicy>,
    sleeper: Option<Arc<dyn Sleeper>>,
    registry: Option<Arc<BreakerRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    fallbacks: FallbackTable<T::Request, T::Response>,
    registration_error: Option<RegistrationError>,
    emitter: Emitter,
}

impl<T: Transport> ServiceClientBuilder<T> {
    pub fn new(target: impl Into<String>, transport: T) -> Self {
        Self {
            target: target.into(),
            transport,
            config: TargetConfig::default(),
            retry: None,
            sleeper: None,
            registry: None,
            clock: None,
            fallbacks: FallbackTable::new(),
            registration_error: None,
            emitter: Emitter::null(),
        }
    }

    pub fn config(mut self, config: TargetConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the entry for this client's target from a shared [`ClientConfig`].
    pub fn client_config(mut self, config: &ClientConfig) -> Self {
        self.config = config.for_target(&self.target);
        self
    }

    /// Replace the retry policy derived from the config.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sleeper for inter-attempt delays. Overrides the sleeper of any explicit policy.
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Share breakers with other clients. Without one, the client owns a private registry.
    pub fn registry(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Clock for the private registry. Ignored when a registry is supplied.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.emitter = Emitter::new(sink);
        self
    }

    /// Bind a fallback for `operation` on this client's target.
    ///
    /// Binding the same operation twice fails the eventual [`build`](Self::build).
    pub fn fallback<F>(self, operation: impl Into<String>, fallback: F) -> Self
    where
        F: Fn(&T::Request, &CallFailure) -> Result<T::Response, BoxError> + Send + Sync + 'static,
    {
        self.fallback_handler(operation, fallback)
    }

    /// Bind any [`Fallback`] implementation for `operation`.
    pub fn fallback_handler<H>(mut self, operation: impl Into<String>, fallback: H) -> Self
    where
        H: Fallback<T::Request, T::Response>,
    {
        if let Err(err) = self.fallbacks.register_handler(self.target.clone(), operation, fallback)
        {
            self.registration_error.get_or_insert(err);
        }
        self
    }

    /// Replace all bindings with `table`. Only entries for this client's target are consulted.
    pub fn fallbacks(mut self, table: FallbackTable<T::Request, T::Response>) -> Self {
        self.fallbacks = table;
        self
    }

    pub fn build(self) -> Result<ServiceClient<T>, RegistrationError> {
        if let Some(err) = self.registration_error {
            return Err(err);
        }
        let mut retry = self.retry.unwrap_or_else(|| RetryPolicy::from_config(&self.config.retry));
        if let Some(sleeper) = self.sleeper {
            retry.set_sleeper(sleeper);
        }
        let registry = self.registry.unwrap_or_else(|| {
            let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
            Arc::new(BreakerRegistry::with_clock(clock))
        });
        debug!(
            target_name = %self.target,
            fallbacks = self.fallbacks.len(),
            max_attempts = retry.max_attempts(),
            "service client built"
        );
        Ok(ServiceClient {
            target: self.target,
            transport: Arc::new(self.transport),
            registry,
            breaker: Arc::new(OnceLock::new()),
            config: self.config,
            retry,
            fallbacks: Arc::new(self.fallbacks),
            emitter: self.emitter,
        })
    }
}
