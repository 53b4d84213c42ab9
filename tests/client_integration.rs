mod common;

use common::{harness, not_found, target_config, transient, Scripted, Step};
use peercall::{
    fallback, BreakerRegistry, CallFailure, CircuitState, ClientError, ClientEventKind, MemorySink,
    Outcome, RecordingSleeper, Reply, ServiceClient, TransportFailure,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn success_returns_remote_value() {
    let h = harness(Scripted::always(Step::Reply(7)), target_config(10, 0.5, 1000, 2, 3));
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(reply, Reply::Remote(7));
    assert!(!reply.is_fallback());
    assert_eq!(h.client.breaker().snapshot().window_len, 1);
}

#[tokio::test]
async fn transient_failures_exhaust_after_max_attempts() {
    let h = harness(Scripted::always(transient()), target_config(10, 0.5, 1000, 2, 3));

    let reply = h.client.invoke("get", &1).await.unwrap();

    assert_eq!(h.transport().calls(), 3);
    match reply {
        Reply::Fallback { value, cause: CallFailure::ExhaustedRetries { attempts, last } } => {
            assert_eq!(value, 0);
            assert_eq!(attempts, 3);
            assert_eq!(last.status(), Some(503));
        }
        other => panic!("expected exhausted fallback, got {other:?}"),
    }

    let snap = h.client.breaker().snapshot();
    assert_eq!((snap.window_len, snap.window_failures), (3, 3));

    let kinds = h.sink.kinds();
    let outcomes = kinds
        .iter()
        .filter(|k| matches!(k, ClientEventKind::AttemptOutcome { outcome: Outcome::Failure, .. }))
        .count();
    let retries =
        kinds.iter().filter(|k| matches!(k, ClientEventKind::RetryScheduled { .. })).count();
    assert_eq!(outcomes, 3);
    assert_eq!(retries, 2);
    assert_eq!(
        kinds.last(),
        Some(&ClientEventKind::FallbackInvoked { operation: "get".into(), cause: "exhausted_retries" })
    );
}

#[tokio::test]
async fn backoff_schedule_is_applied_between_attempts() {
    let sleeper = RecordingSleeper::new();
    let mut config = target_config(10, 0.5, 1000, 2, 4);
    config.retry = peercall::RetryConfig::new(
        4,
        peercall::Backoff::sequence(vec![
            Duration::from_millis(100),
            Duration::from_millis(250),
        ])
        .unwrap(),
        Duration::from_secs(1),
    )
    .unwrap();
    let client = ServiceClient::builder("media", Scripted::always(transient()))
        .config(config)
        .sleeper(sleeper.clone())
        .fallback("get", fallback::value(0))
        .build()
        .unwrap();

    client.invoke("get", &1).await.unwrap();
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_millis(100), Duration::from_millis(250), Duration::from_millis(250)]
    );
}

#[tokio::test]
async fn client_error_is_never_retried() {
    let h = harness(Scripted::always(not_found()), target_config(10, 0.5, 1000, 2, 5));
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.transport().calls(), 1);
    assert!(matches!(reply.cause(), Some(CallFailure::ClientRequest(f)) if f.status() == Some(404)));
    // counted as a failure by default
    assert_eq!(h.client.breaker().snapshot().window_failures, 1);
}

#[tokio::test]
async fn unknown_failure_is_unclassified_and_not_retried() {
    let h = harness(
        Scripted::always(Step::Fail(TransportFailure::unknown("garbled response"))),
        target_config(10, 0.5, 1000, 2, 3),
    );
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.transport().calls(), 1);
    assert!(matches!(reply.cause(), Some(CallFailure::Unclassified(_))));
}

#[tokio::test]
async fn open_breaker_fails_fast_without_touching_transport() {
    let h = harness(Scripted::always(transient()), target_config(4, 0.5, 1000, 2, 1));
    for _ in 0..4 {
        h.client.invoke("get", &1).await.unwrap();
    }
    assert_eq!(h.client.state(), CircuitState::Open);
    assert_eq!(h.transport().calls(), 4);

    h.clock.advance(400);
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.transport().calls(), 4);
    match reply.cause() {
        Some(CallFailure::CircuitOpen { target, retry_after }) => {
            assert_eq!(target, "media");
            assert_eq!(*retry_after, Duration::from_millis(600));
        }
        other => panic!("expected circuit open, got {other:?}"),
    }
    assert!(h
        .sink
        .kinds()
        .contains(&ClientEventKind::PermissionDenied { retry_after: Duration::from_millis(600) }));
    // a denied call leaves the window alone
    assert_eq!(h.client.breaker().snapshot().window_len, 0);
}

#[tokio::test]
async fn threshold_is_evaluated_once_the_window_fills() {
    let steps = [
        transient(),
        Step::Reply(1),
        transient(),
        transient(),
        Step::Reply(1),
        transient(),
        Step::Reply(1),
        transient(),
        Step::Reply(1),
    ];
    let h = harness(Scripted::new(steps, transient()), target_config(10, 0.5, 1000, 2, 1));
    for _ in 0..9 {
        h.client.invoke("get", &1).await.unwrap();
        assert_eq!(h.client.state(), CircuitState::Closed);
    }
    h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.client.state(), CircuitState::Open);
    assert_eq!(h.client.breaker().snapshot().window_len, 0);

    let transitions: Vec<_> = h
        .sink
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, ClientEventKind::StateTransition { .. }))
        .collect();
    assert_eq!(
        transitions,
        vec![ClientEventKind::StateTransition { from: CircuitState::Closed, to: CircuitState::Open }]
    );
}

#[tokio::test]
async fn breaker_opening_mid_retry_stops_the_loop() {
    let h = harness(Scripted::always(transient()), target_config(2, 0.5, 1000, 1, 5));
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.transport().calls(), 2);
    assert!(matches!(reply.cause(), Some(CallFailure::CircuitOpen { .. })));
}

#[tokio::test]
async fn missing_fallback_escapes_as_configuration_error() {
    let h = harness(Scripted::always(transient()), target_config(10, 0.5, 1000, 2, 2));
    let err = h.client.invoke("list", &1).await.unwrap_err();
    match &err {
        ClientError::UnregisteredFallback { target, operation, cause } => {
            assert_eq!(target, "media");
            assert_eq!(operation, "list");
            assert!(cause.is_exhausted());
        }
        other => panic!("expected unregistered fallback, got {other:?}"),
    }
    assert_eq!(
        h.sink.kinds().last(),
        Some(&ClientEventKind::FallbackFailed { operation: "list".into() })
    );
}

#[tokio::test]
async fn reraising_fallback_escapes_as_fallback_failure() {
    let h = harness(Scripted::always(not_found()), target_config(10, 0.5, 1000, 2, 3));
    let err = h.client.invoke("remove", &1).await.unwrap_err();
    assert!(err.is_fallback_failure());
    assert!(matches!(err.cause(), CallFailure::ClientRequest(_)));
    let source = err.source().expect("fallback error source").to_string();
    assert!(source.contains("request rejected"), "unexpected source: {source}");
}

#[tokio::test]
async fn fallback_sees_original_arguments() {
    let client = ServiceClient::builder("media", Scripted::always(transient()))
        .config(target_config(10, 0.5, 1000, 2, 1))
        .fallback("get", |id: &u32, _cause: &CallFailure| Ok(id * 100))
        .build()
        .unwrap();
    assert_eq!(client.invoke("get", &4).await.unwrap().into_inner(), 400);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out_as_transient_failure() {
    let mut config = target_config(10, 0.5, 1000, 2, 2);
    config.retry = peercall::RetryConfig::new(
        2,
        peercall::Backoff::constant(Duration::from_millis(10)),
        Duration::from_millis(100),
    )
    .unwrap();
    let transport = Scripted::new([Step::Delay(Duration::from_secs(5), 1)], Step::Reply(2));
    let client = ServiceClient::builder("media", transport)
        .config(config)
        .fallback("get", fallback::value(0))
        .build()
        .unwrap();

    let reply = client.invoke("get", &1).await.unwrap();
    assert_eq!(reply, Reply::Remote(2));
    assert_eq!(client.transport().calls(), 2);
    let snap = client.breaker().snapshot();
    assert_eq!((snap.window_len, snap.window_failures), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn cancelled_invocation_counts_in_flight_attempt_as_failure() {
    let h = harness(Scripted::always(Step::Hang), target_config(10, 0.5, 1000, 2, 3));
    let outcome = tokio::time::timeout(Duration::from_millis(50), h.client.invoke("get", &1)).await;
    assert!(outcome.is_err());
    assert_eq!(h.transport().calls(), 1);
    let snap = h.client.breaker().snapshot();
    assert_eq!((snap.window_len, snap.window_failures), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn cancelled_during_backoff_records_nothing_more() {
    let sink = MemorySink::new();
    let client = ServiceClient::builder("media", Scripted::always(transient()))
        .config(target_config(10, 0.5, 1000, 2, 3))
        .telemetry(sink.clone())
        .fallback("get", fallback::value(0))
        .build()
        .unwrap();

    // first attempt fails at once, then the 10ms backoff outlives the 5ms budget
    let outcome = tokio::time::timeout(Duration::from_millis(5), client.invoke("get", &1)).await;
    assert!(outcome.is_err());
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(client.transport().calls(), 1);
    let snap = client.breaker().snapshot();
    assert_eq!((snap.window_len, snap.window_failures), (1, 1));
    let outcomes = sink
        .kinds()
        .iter()
        .filter(|k| matches!(k, ClientEventKind::AttemptOutcome { .. }))
        .count();
    assert_eq!(outcomes, 1);
    assert!(!sink.kinds().iter().any(|k| matches!(k, ClientEventKind::FallbackInvoked { .. })));
}

#[tokio::test]
async fn excluded_client_error_returns_the_trial_slot() {
    let mut config = target_config(2, 0.5, 1000, 1, 1);
    config.breaker = config.breaker.with_client_errors_counted(false);
    let h = harness(
        Scripted::new([transient(), transient(), not_found()], Step::Reply(7)),
        config,
    );

    h.client.invoke("get", &1).await.unwrap();
    h.client.invoke("get", &1).await.unwrap();
    assert_eq!(h.client.state(), CircuitState::Open);

    h.clock.advance(1000);
    let rejected = h.client.invoke("get", &1).await.unwrap();
    assert!(matches!(rejected.cause(), Some(CallFailure::ClientRequest(_))));
    assert_eq!(h.client.state(), CircuitState::HalfOpen);

    // the single trial slot is available again
    let reply = h.client.invoke("get", &1).await.unwrap();
    assert_eq!(reply, Reply::Remote(7));
    assert_eq!(h.transport().calls(), 4);
    assert_eq!(h.client.state(), CircuitState::Closed);
}

#[tokio::test]
async fn clients_sharing_a_registry_share_the_breaker() {
    let registry = Arc::new(BreakerRegistry::new());
    let config = target_config(2, 0.5, 60_000, 1, 1);
    let build = |transport: Scripted| {
        ServiceClient::builder("media", transport)
            .config(config.clone())
            .registry(registry.clone())
            .fallback("get", fallback::value(0))
            .build()
            .unwrap()
    };
    let failing = build(Scripted::always(transient()));
    let healthy = build(Scripted::always(Step::Reply(5)));

    failing.invoke("get", &1).await.unwrap();
    failing.invoke("get", &1).await.unwrap();
    assert_eq!(healthy.state(), CircuitState::Open);

    let reply = healthy.invoke("get", &1).await.unwrap();
    assert!(reply.cause().is_some_and(CallFailure::is_circuit_open));
    assert_eq!(healthy.transport().calls(), 0);
    assert_eq!(registry.snapshot(), vec![("media".to_string(), CircuitState::Open)]);
}

#[tokio::test]
async fn concurrent_invocations_are_all_recorded() {
    let h = harness(Scripted::always(Step::Reply(1)), target_config(100, 0.5, 1000, 2, 1));
    let client = Arc::new(h.client);
    let calls = (0..50).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.invoke("get", &i).await })
    });
    for result in futures::future::join_all(calls).await {
        assert!(matches!(result.unwrap(), Ok(Reply::Remote(1))));
    }
    assert_eq!(client.breaker().snapshot().window_len, 50);
}
