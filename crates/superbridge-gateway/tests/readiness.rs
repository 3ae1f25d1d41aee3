//! Single-flight model loading.

use std::time::Duration;

use superbridge_gateway::{GatewayError, GatewayState, ReadyFailure};
use superbridge_test::prelude::*;
use tokio::time::Instant;

fn ready_failure(err: &GatewayError) -> ReadyFailure {
    match err {
        GatewayError::Ready(e) => e.kind,
        other => panic!("expected a readiness error, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_load() {
    let upstream = MockUpstream::new().with_load_delay(Duration::from_secs(5));
    let gateway = test_gateway(&upstream);
    gateway.connect().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move { gateway.ensure_ready().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(upstream.load_calls(), 1);
    assert_eq!(gateway.load_attempts(), 1);
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_late_caller_joins_running_load() {
    let upstream = MockUpstream::new().with_load_delay(Duration::from_secs(45));
    let gateway = test_gateway(&upstream);
    gateway.connect().await.unwrap();
    let start = Instant::now();

    let early = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.ensure_ready().await.map(|()| start.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(gateway.state(), GatewayState::LoadingModels);

    let late = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.ensure_ready().await.map(|()| start.elapsed())
        })
    };

    let early = early.await.unwrap().unwrap();
    let late = late.await.unwrap().unwrap();

    assert!(early >= Duration::from_secs(45) && early < Duration::from_secs(46), "{early:?}");
    assert!(late >= Duration::from_secs(45) && late < Duration::from_secs(46), "{late:?}");
    assert_eq!(upstream.load_calls(), 1);
}

#[tokio::test]
async fn test_rejected_load_reaches_every_waiter_and_does_not_poison() {
    let upstream = MockUpstream::new()
        .with_load_delay(Duration::from_millis(50))
        .with_load_outcome(LoadOutcome::Reject);
    let gateway = test_gateway(&upstream);
    gateway.connect().await.unwrap();

    let (a, b, c) = tokio::join!(
        gateway.ensure_ready(),
        gateway.ensure_ready(),
        gateway.ensure_ready()
    );
    for result in [a, b, c] {
        assert_eq!(ready_failure(&result.unwrap_err()), ReadyFailure::Rejected);
    }
    assert_eq!(upstream.load_calls(), 1);
    // The channel is fine; only readiness failed.
    assert_eq!(gateway.state(), GatewayState::Connected);

    upstream.set_load_outcome(LoadOutcome::Succeed);
    gateway.ensure_ready().await.unwrap();
    assert_eq!(upstream.load_calls(), 2);
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_caller_probing_across_a_failed_load_shares_its_outcome() {
    // Each probe takes two seconds; the load takes half a second.
    let upstream = MockUpstream::new()
        .with_probe_delay(Duration::from_secs(1))
        .with_load_delay(Duration::from_millis(500))
        .with_load_outcome(LoadOutcome::Reject);
    let mut config = test_config();
    config.timeouts.probe_secs = 10;
    let (gateway, _connector) = test_gateway_with(&upstream, config);
    gateway.connect().await.unwrap();

    let first = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.ensure_ready().await })
    };
    // Starts probing before the first caller's load exists, finishes after it failed.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.ensure_ready().await })
    };

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();
    assert_eq!(ready_failure(&first), ReadyFailure::Rejected);
    assert_eq!(ready_failure(&second), ReadyFailure::Rejected);
    assert_eq!(upstream.load_calls(), 1);
    assert_eq!(gateway.state(), GatewayState::Connected);

    // A fresh attempt afterwards still loads.
    upstream.set_load_outcome(LoadOutcome::Succeed);
    gateway.ensure_ready().await.unwrap();
    assert_eq!(upstream.load_calls(), 2);
}

#[tokio::test]
async fn test_remote_error_leaves_channel_connected() {
    let upstream =
        MockUpstream::new().with_load_outcome(LoadOutcome::RemoteError("out of memory".into()));
    let gateway = test_gateway(&upstream);

    let err = gateway.ensure_ready().await.unwrap_err();
    assert_eq!(ready_failure(&err), ReadyFailure::Remote);
    assert!(err.to_string().contains("out of memory"));
    assert_eq!(gateway.state(), GatewayState::Connected);
}

#[tokio::test]
async fn test_disconnect_mid_load_degrades() {
    let upstream = MockUpstream::new().with_load_outcome(LoadOutcome::DropChannel);
    let gateway = test_gateway(&upstream);

    let err = gateway.ensure_ready().await.unwrap_err();
    assert_eq!(ready_failure(&err), ReadyFailure::Transport);
    assert_eq!(gateway.state(), GatewayState::Degraded);

    // Recovery is on demand.
    upstream.set_load_outcome(LoadOutcome::Succeed);
    let report = gateway.reconnect().await.unwrap();
    assert!(report.models_loaded);
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_load_timeout_degrades() {
    let upstream = MockUpstream::new().with_load_delay(Duration::from_secs(600));
    let mut config = test_config();
    config.timeouts.load_secs = 10;
    let (gateway, _connector) = test_gateway_with(&upstream, config);

    let start = Instant::now();
    let err = gateway.ensure_ready().await.unwrap_err();

    assert_eq!(ready_failure(&err), ReadyFailure::Timeout);
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));
    assert_eq!(gateway.state(), GatewayState::Degraded);
}

#[tokio::test]
async fn test_middleware_down_fails_without_loading() {
    let upstream = MockUpstream::new();
    upstream.set_middleware_up(false);
    let gateway = test_gateway(&upstream);

    let err = gateway.ensure_ready().await.unwrap_err();
    assert_eq!(ready_failure(&err), ReadyFailure::MiddlewareDown);
    assert_eq!(upstream.load_calls(), 0);
    assert_eq!(gateway.state(), GatewayState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_during_load_interrupts_waiters() {
    let upstream = MockUpstream::new().with_load_delay(Duration::from_secs(30));
    let gateway = test_gateway(&upstream);
    gateway.connect().await.unwrap();

    let waiter = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.ensure_ready().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gateway.state(), GatewayState::LoadingModels);

    gateway.disconnect().await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(
        ready_failure(&err),
        ReadyFailure::Interrupted | ReadyFailure::Transport
    ));
    assert_eq!(gateway.state(), GatewayState::Disconnected);
}
