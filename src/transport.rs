//! The transport port: whatever actually performs a remote operation.
//!
//! The client never builds or parses network messages. It hands the operation name, the
//! arguments and a per-attempt timeout to a [`Transport`] and gets back a response or a classified
//! [`TransportFailure`]. Any `tower::Service` can serve as a transport through [`TowerTransport`].

use crate::config::TargetConfig;
use crate::error::TransportFailure;
use async_trait::async_trait;
use std::time::Duration;
use tower::{Service, ServiceExt};

/// Single-operation interface to a remote target.
///
/// Implementations should honor `timeout`; the client additionally enforces it by dropping the
/// returned future once the budget is spent.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + 'static;

    async fn perform(
        &self,
        operation: &str,
        args: &Self::Request,
        timeout: Duration,
    ) -> Result<Self::Response, TransportFailure>;
}

/// Request passed to a tower service by [`TowerTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest<Req> {
    pub operation: String,
    pub args: Req,
    pub timeout: Duration,
    /// Base URL of the target, when the transport was bound to one.
    pub base_url: Option<String>,
}

/// Adapts a `tower::Service<TransportRequest<Req>>` to [`Transport`].
///
/// The service is cloned per attempt and driven with `oneshot`, so readiness is honored.
#[derive(Debug, Clone)]
pub struct TowerTransport<S, Req> {
    inner: S,
    base_url: Option<String>,
    _request: std::marker::PhantomData<fn(Req)>,
}

impl<S, Req> TowerTransport<S, Req> {
    pub fn new(inner: S) -> Self {
        Self { inner, base_url: None, _request: std::marker::PhantomData }
    }

    /// Stamp every request with `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Transport for the target described by `config`, carrying its base URL if it has one.
    pub fn for_target(inner: S, config: &TargetConfig) -> Self {
        Self { inner, base_url: config.base_url.clone(), _request: std::marker::PhantomData }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S, Req> Transport for TowerTransport<S, Req>
where
    S: Service<TransportRequest<Req>> + Clone + Send + Sync + 'static,
    S::Response: Send + 'static,
    S::Error: Into<TransportFailure>,
    S::Future: Send,
    Req: Clone + Send + Sync + 'static,
{
    type Request = Req;
    type Response = S::Response;

    async fn perform(
        &self,
        operation: &str,
        args: &Req,
        timeout: Duration,
    ) -> Result<S::Response, TransportFailure> {
        let request = TransportRequest {
            operation: operation.to_string(),
            args: args.clone(),
            timeout,
            base_url: self.base_url.clone(),
        };
        self.inner.clone().oneshot(request).await.map_err(Into::into)
    }
}
