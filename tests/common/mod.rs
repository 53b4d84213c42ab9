#![allow(dead_code)]

use async_trait::async_trait;
use peercall::{
    fallback, Backoff, BreakerConfig, ManualClock, MemorySink, RetryConfig, ServiceClient,
    TargetConfig, Transport, TransportFailure,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the scripted transport does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(u32),
    Fail(TransportFailure),
    /// Sleep on the tokio timer, then reply.
    Delay(Duration, u32),
    /// Never complete.
    Hang,
}

/// Transport that plays back `steps` in order, repeating `then` once they run out.
#[derive(Debug)]
pub struct Scripted {
    steps: Mutex<VecDeque<Step>>,
    then: Step,
    calls: AtomicUsize,
}

impl Scripted {
    pub fn new(steps: impl IntoIterator<Item = Step>, then: Step) -> Self {
        Self { steps: Mutex::new(steps.into_iter().collect()), then, calls: AtomicUsize::new(0) }
    }

    pub fn always(step: Step) -> Self {
        Self::new([], step)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queue more steps ahead of `then`.
    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl Transport for Scripted {
    type Request = u32;
    type Response = u32;

    async fn perform(
        &self,
        _operation: &str,
        _args: &u32,
        _timeout: Duration,
    ) -> Result<u32, TransportFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| self.then.clone());
        match step {
            Step::Reply(v) => Ok(v),
            Step::Fail(f) => Err(f),
            Step::Delay(d, v) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Step::Hang => futures::future::pending().await,
        }
    }
}

pub fn transient() -> Step {
    Step::Fail(TransportFailure::from_status(503, "unavailable"))
}

pub fn not_found() -> Step {
    Step::Fail(TransportFailure::from_status(404, "no such media"))
}

pub fn target_config(
    window: usize,
    threshold: f64,
    open_ms: u64,
    trials: usize,
    attempts: usize,
) -> TargetConfig {
    TargetConfig {
        breaker: BreakerConfig::new(window, threshold, Duration::from_millis(open_ms), trials)
            .unwrap(),
        retry: RetryConfig::new(
            attempts,
            Backoff::constant(Duration::from_millis(10)),
            Duration::from_secs(1),
        )
        .unwrap(),
        base_url: None,
    }
}

pub struct Harness {
    pub client: ServiceClient<Scripted>,
    pub clock: ManualClock,
    pub sink: MemorySink,
}

impl Harness {
    pub fn transport(&self) -> &Scripted {
        self.client.transport()
    }
}

/// Client for target "media" with a `get` fallback returning 0 and a `remove` fallback that
/// re-raises.
pub fn harness(transport: Scripted, config: TargetConfig) -> Harness {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let client = ServiceClient::builder("media", transport)
        .config(config)
        .clock(Arc::new(clock.clone()))
        .sleeper(peercall::InstantSleeper)
        .telemetry(sink.clone())
        .fallback("get", fallback::value(0))
        .fallback("remove", fallback::reraise())
        .build()
        .unwrap();
    Harness { client, clock, sink }
}
