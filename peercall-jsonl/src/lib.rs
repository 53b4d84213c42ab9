//! JSONL sink for `peercall`. Writes one event per line.
//! Always appends; bring your own path.

use peercall::telemetry::{ClientEvent, ClientEventKind, TelemetrySink};
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<ClientEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await.map_err(|err| {
                tracing::warn!(path = %path.display(), error = %err, "jsonl sink flush failed");
                err
            })
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

/// Flat JSON object for one event.
pub fn event_to_json(event: &ClientEvent) -> serde_json::Value {
    let target = event.target.as_str();
    let kind = event.kind.name();
    match &event.kind {
        ClientEventKind::PermissionDenied { retry_after } => {
            json!({ "target": target, "kind": kind, "retry_after_ms": retry_after.as_millis() as u64 })
        }
        ClientEventKind::AttemptOutcome { operation, attempt, outcome, duration } => json!({
            "target": target,
            "kind": kind,
            "operation": operation,
            "attempt": attempt,
            "outcome": outcome.as_str(),
            "duration_ms": duration.as_millis() as u64,
        }),
        ClientEventKind::StateTransition { from, to } => {
            json!({ "target": target, "kind": kind, "from": from.as_str(), "to": to.as_str() })
        }
        ClientEventKind::RetryScheduled { operation, attempt, delay } => json!({
            "target": target,
            "kind": kind,
            "operation": operation,
            "attempt": attempt,
            "delay_ms": delay.as_millis() as u64,
        }),
        ClientEventKind::FallbackInvoked { operation, cause } => {
            json!({ "target": target, "kind": kind, "operation": operation, "cause": cause })
        }
        ClientEventKind::FallbackFailed { operation } => {
            json!({ "target": target, "kind": kind, "operation": operation })
        }
    }
}
