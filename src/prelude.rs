//! Convenient re-exports for building and calling clients.
pub use crate::{
    backoff::Backoff,
    client::{Reply, ServiceClient, ServiceClientBuilder},
    config::{BreakerConfig, ClientConfig, RetryConfig, TargetConfig},
    error::{CallFailure, ClientError, TransportFailure},
    fallback::{self, Fallback, FallbackTable},
    registry::BreakerRegistry,
    telemetry::{ClientEvent, ClientEventKind, TelemetrySink},
    transport::{TowerTransport, Transport, TransportRequest},
};
