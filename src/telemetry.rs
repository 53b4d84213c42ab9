//! Telemetry for service calls.
//!
//! Every client emits structured [`ClientEvent`]s: permission denials, attempt outcomes, breaker
//! transitions, scheduled retries and fallback activity. Events flow into a [`TelemetrySink`],
//! which is a `tower::Service<ClientEvent>` so sinks compose with ordinary tower tooling.
//!
//! Emission is best-effort. A sink that is not ready or that errors loses the event; the call
//! itself is never affected.
//!
//! ```rust
//! use peercall::telemetry::{ClientEvent, ClientEventKind, MemorySink};
//! use peercall::CircuitState;
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = ClientEvent::new(
//!     "media",
//!     ClientEventKind::StateTransition { from: CircuitState::Closed, to: CircuitState::Open },
//! );
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use crate::circuit_breaker::{CircuitState, Outcome, Transition};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes client events.
pub trait TelemetrySink:
    tower::Service<ClientEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ClientEvent)
where
    S: tower::Service<ClientEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// One event, attributed to the target that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub target: String,
    pub kind: ClientEventKind,
}

impl ClientEvent {
    pub fn new(target: impl Into<String>, kind: ClientEventKind) -> Self {
        Self { target: target.into(), kind }
    }

    pub(crate) fn transition(target: &str, transition: &Transition) -> Self {
        Self::new(
            target,
            ClientEventKind::StateTransition { from: transition.from, to: transition.to },
        )
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEventKind {
    /// The breaker refused an attempt.
    PermissionDenied { retry_after: Duration },
    /// An attempt finished (or was abandoned) and its outcome was reported.
    AttemptOutcome { operation: String, attempt: usize, outcome: Outcome, duration: Duration },
    /// The breaker changed state.
    StateTransition { from: CircuitState, to: CircuitState },
    /// A failed attempt will be retried after `delay`.
    RetryScheduled { operation: String, attempt: usize, delay: Duration },
    /// The fallback was asked for a substitute; `cause` is the failure label.
    FallbackInvoked { operation: String, cause: &'static str },
    /// The fallback itself failed, or none was registered.
    FallbackFailed { operation: String },
}

impl ClientEventKind {
    /// Stable snake_case name, used by structured sinks.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEventKind::PermissionDenied { .. } => "permission_denied",
            ClientEventKind::AttemptOutcome { .. } => "attempt_outcome",
            ClientEventKind::StateTransition { .. } => "state_transition",
            ClientEventKind::RetryScheduled { .. } => "retry_scheduled",
            ClientEventKind::FallbackInvoked { .. } => "fallback_invoked",
            ClientEventKind::FallbackFailed { .. } => "fallback_failed",
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.target, self.kind)
    }
}

impl fmt::Display for ClientEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEventKind::PermissionDenied { retry_after } => {
                write!(f, "PermissionDenied(retry_after={:?})", retry_after)
            }
            ClientEventKind::AttemptOutcome { operation, attempt, outcome, duration } => {
                write!(f, "AttemptOutcome({operation} #{attempt} {outcome} in {duration:?})")
            }
            ClientEventKind::StateTransition { from, to } => {
                write!(f, "StateTransition({from} -> {to})")
            }
            ClientEventKind::RetryScheduled { operation, attempt, delay } => {
                write!(f, "RetryScheduled({operation} after #{attempt}, delay={delay:?})")
            }
            ClientEventKind::FallbackInvoked { operation, cause } => {
                write!(f, "FallbackInvoked({operation}, cause={cause})")
            }
            ClientEventKind::FallbackFailed { operation } => write!(f, "FallbackFailed({operation})"),
        }
    }
}

/// Type-erased handle the client uses to reach its sink.
#[derive(Clone)]
pub(crate) struct Emitter {
    emit: Arc<dyn Fn(ClientEvent) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Emitter")
    }
}

impl Emitter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self { emit: Arc::new(move |event| Box::pin(emit_best_effort(sink.clone(), event))) }
    }

    pub(crate) fn null() -> Self {
        Self::new(NullSink)
    }

    pub(crate) async fn emit(&self, event: ClientEvent) {
        (self.emit)(event).await;
    }

    /// Emit from a synchronous context such as `Drop`. Dropped when no runtime is running.
    pub(crate) fn emit_detached(&self, event: ClientEvent) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn((self.emit)(event));
            }
            Err(_) => tracing::debug!(event = %event, "no runtime; telemetry event dropped"),
        }
    }
}

/// A sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ClientEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ClientEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ClientEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        tracing::info!(target_name = %event.target, kind = event.kind.name(), event = %event.kind, "client_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A sink that keeps events in memory. Oldest events are evicted past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ClientEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.lock().clone()
    }

    /// Kinds of the stored events, in arrival order.
    pub fn kinds(&self) -> Vec<ClientEventKind> {
        self.lock().iter().map(|e| e.kind.clone()).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ClientEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
