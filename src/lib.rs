#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # peercall
//!
//! Resilient service-to-service calls: a per-target client that gates every attempt through a
//! windowed circuit breaker, retries transient failures with deterministic backoff, and resolves
//! a registered fallback when the remote value cannot be obtained.
//!
//! ## Features
//!
//! - **Circuit breakers** with a rolling outcome window and immediate half-open trial evaluation
//! - **Retry policies** that only retry transient failures, with constant, linear, exponential or
//!   explicit backoff
//! - **Fallbacks** bound per `(target, operation)` that see the triggering failure
//! - **Telemetry** as a `tower::Service<ClientEvent>` sink
//! - **Transport agnostic**: anything implementing [`Transport`], including any `tower::Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use peercall::{
//!     fallback, Backoff, BreakerConfig, Reply, RetryConfig, ServiceClient, TargetConfig,
//!     TowerTransport, TransportFailure, TransportRequest,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = TowerTransport::new(tower::service_fn(|_req: TransportRequest<u64>| async {
//!         Err::<String, _>(TransportFailure::from_status(503, "maintenance"))
//!     }));
//!
//!     let config = TargetConfig {
//!         breaker: BreakerConfig::new(10, 0.5, Duration::from_secs(30), 2).unwrap(),
//!         retry: RetryConfig::new(3, Backoff::constant(Duration::from_millis(1)), Duration::from_secs(1))
//!             .unwrap(),
//!         ..TargetConfig::default()
//!     };
//!
//!     let client = ServiceClient::builder("media", transport)
//!         .config(config)
//!         .fallback("get_media", fallback::value(String::from("placeholder.png")))
//!         .build()
//!         .unwrap();
//!
//!     match client.invoke("get_media", &42).await.unwrap() {
//!         Reply::Fallback { value, cause } => {
//!             assert_eq!(value, "placeholder.png");
//!             assert!(cause.is_exhausted());
//!         }
//!         Reply::Remote(_) => unreachable!(),
//!     }
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod log_capture;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitState, Outcome, Permit, Transition,
};
pub use client::{Reply, ServiceClient, ServiceClientBuilder};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BreakerConfig, ClientConfig, RetryConfig, TargetConfig};
pub use error::{
    BoxError, CallFailure, ClientError, ConfigError, FailureKind, RegistrationError,
    TransportFailure,
};
pub use fallback::{Fallback, FallbackTable};
pub use registry::{BreakerRegistry, RegistryError};
pub use retry::{RetryContext, RetryDecision, RetryPolicy, RetryPolicyBuilder, StopReason};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use telemetry::{ClientEvent, ClientEventKind, LogSink, MemorySink, NullSink, TelemetrySink};
pub use transport::{TowerTransport, Transport, TransportRequest};
