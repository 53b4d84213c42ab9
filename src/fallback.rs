//! Fallback bindings keyed by `(target, operation)`.
//!
//! A fallback receives the original arguments and the [`CallFailure`] that triggered it, so it can
//! pick a substitute per cause: an empty value for a read, or a re-raise for a mutation where a
//! fabricated success would corrupt state. Bindings are made at construction time and never change
//! afterwards. A missing binding is a configuration defect and surfaces as
//! [`ClientError::UnregisteredFallback`]; there is no silent default.
//!
//! ```rust
//! use peercall::{fallback, CallFailure, FallbackTable, TransportFailure};
//!
//! let mut table: FallbackTable<u64, String> = FallbackTable::new();
//! table.register("media", "get_media", fallback::value(String::from("no-image"))).unwrap();
//! table.register("media", "remove_media", fallback::reraise()).unwrap();
//!
//! let cause = CallFailure::ClientRequest(TransportFailure::client_error("gone"));
//! assert_eq!(table.resolve("media", "get_media", &cause, &7).unwrap(), "no-image");
//! assert!(table.resolve("media", "remove_media", &cause, &7).is_err());
//! ```

use crate::error::{BoxError, CallFailure, ClientError, RegistrationError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Produces a substitute result for a failed call.
///
/// Implemented for every `Fn(&Req, &CallFailure) -> Result<Resp, BoxError>` closure; implement it
/// directly for handlers that carry their own state.
pub trait Fallback<Req, Resp>: Send + Sync + 'static {
    fn recover(&self, args: &Req, failure: &CallFailure) -> Result<Resp, BoxError>;
}

impl<Req, Resp, F> Fallback<Req, Resp> for F
where
    F: Fn(&Req, &CallFailure) -> Result<Resp, BoxError> + Send + Sync + 'static,
{
    fn recover(&self, args: &Req, failure: &CallFailure) -> Result<Resp, BoxError> {
        self(args, failure)
    }
}

type SharedFallback<Req, Resp> = Arc<dyn Fallback<Req, Resp>>;

/// Immutable-after-construction table of fallbacks.
pub struct FallbackTable<Req, Resp> {
    bindings: HashMap<String, HashMap<String, SharedFallback<Req, Resp>>>,
}

impl<Req, Resp> Clone for FallbackTable<Req, Resp> {
    fn clone(&self) -> Self {
        Self { bindings: self.bindings.clone() }
    }
}

impl<Req, Resp> fmt::Debug for FallbackTable<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .bindings
            .iter()
            .flat_map(|(target, ops)| ops.keys().map(move |op| format!("{target}.{op}")))
            .collect();
        keys.sort();
        f.debug_struct("FallbackTable").field("bindings", &keys).finish()
    }
}

impl<Req, Resp> Default for FallbackTable<Req, Resp> {
    fn default() -> Self {
        Self { bindings: HashMap::new() }
    }
}

impl<Req: 'static, Resp: 'static> FallbackTable<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a closure. Each `(target, operation)` pair can be bound once.
    pub fn register<F>(
        &mut self,
        target: impl Into<String>,
        operation: impl Into<String>,
        fallback: F,
    ) -> Result<(), RegistrationError>
    where
        F: Fn(&Req, &CallFailure) -> Result<Resp, BoxError> + Send + Sync + 'static,
    {
        self.register_handler(target, operation, fallback)
    }

    /// Bind any [`Fallback`] implementation.
    pub fn register_handler<H>(
        &mut self,
        target: impl Into<String>,
        operation: impl Into<String>,
        fallback: H,
    ) -> Result<(), RegistrationError>
    where
        H: Fallback<Req, Resp>,
    {
        let target = target.into();
        let operation = operation.into();
        let ops = self.bindings.entry(target.clone()).or_default();
        if ops.contains_key(&operation) {
            return Err(RegistrationError::Duplicate { target, operation });
        }
        ops.insert(operation, Arc::new(fallback));
        Ok(())
    }

    pub fn contains(&self, target: &str, operation: &str) -> bool {
        self.lookup(target, operation).is_some()
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, target: &str, operation: &str) -> Option<&SharedFallback<Req, Resp>> {
        self.bindings.get(target).and_then(|ops| ops.get(operation))
    }

    /// Run the fallback bound to `(target, operation)` for `failure`.
    pub fn resolve(
        &self,
        target: &str,
        operation: &str,
        failure: &CallFailure,
        args: &Req,
    ) -> Result<Resp, ClientError> {
        let Some(fallback) = self.lookup(target, operation) else {
            tracing::error!(
                target_name = %target,
                operation = %operation,
                cause = %failure,
                "no fallback registered"
            );
            return Err(ClientError::UnregisteredFallback {
                target: target.to_string(),
                operation: operation.to_string(),
                cause: failure.clone(),
            });
        };

        fallback.recover(args, failure).map_err(|source| {
            tracing::warn!(
                target_name = %target,
                operation = %operation,
                cause = %failure,
                error = %source,
                "fallback failed"
            );
            ClientError::FallbackFailed {
                target: target.to_string(),
                operation: operation.to_string(),
                cause: failure.clone(),
                source,
            }
        })
    }
}

/// Fallback that always yields a clone of `value`.
pub fn value<Req, Resp>(
    value: Resp,
) -> impl Fn(&Req, &CallFailure) -> Result<Resp, BoxError> + Send + Sync + 'static
where
    Req: 'static,
    Resp: Clone + Send + Sync + 'static,
{
    move |_, _| Ok(value.clone())
}

/// Fallback that yields `Resp::default()`.
pub fn with_default<Req, Resp>(
) -> impl Fn(&Req, &CallFailure) -> Result<Resp, BoxError> + Send + Sync + 'static
where
    Req: 'static,
    Resp: Default + 'static,
{
    |_, _| Ok(Resp::default())
}

/// Fallback that re-raises the triggering failure. Meant for mutating operations.
pub fn reraise<Req, Resp>(
) -> impl Fn(&Req, &CallFailure) -> Result<Resp, BoxError> + Send + Sync + 'static
where
    Req: 'static,
    Resp: 'static,
{
    |_, failure| Err(Box::new(failure.clone()) as BoxError)
}
