//! Connection lifecycle: connect, disconnect, reconnect and the state table.

use superbridge_gateway::{GatewayError, GatewayState, TransportFailure};
use superbridge_test::prelude::*;

use GatewayState::{Connected, Connecting, Degraded, Disconnected, LoadingModels, Ready};

/// Lifecycle edges the gateway may take, written out independently of
/// `GatewayState::can_transition_to`.
const LIFECYCLE_EDGES: &[(GatewayState, GatewayState)] = &[
    // Connect and reconnect.
    (Disconnected, Connecting),
    (Degraded, Connecting),
    (Connecting, Connected),
    (Connecting, Degraded),
    // Readiness.
    (Connected, LoadingModels),
    (Connected, Ready),
    (LoadingModels, Ready),
    (LoadingModels, Connected),
    (LoadingModels, Degraded),
    (Ready, Connected),
    // Transport faults.
    (Connected, Degraded),
    (Ready, Degraded),
    // Disconnect.
    (Connecting, Disconnected),
    (Connected, Disconnected),
    (LoadingModels, Disconnected),
    (Ready, Disconnected),
    (Degraded, Disconnected),
];

fn assert_only_table_edges(gateway: &Gateway) {
    for t in gateway.transitions() {
        assert!(
            LIFECYCLE_EDGES.contains(&(t.from, t.to)),
            "transition outside the lifecycle table {} -> {} ({})",
            t.from,
            t.to,
            t.reason
        );
    }
}

fn path(gateway: &Gateway) -> Vec<(GatewayState, GatewayState)> {
    gateway.transitions().iter().map(|t| (t.from, t.to)).collect()
}

fn states(gateway: &Gateway) -> Vec<GatewayState> {
    gateway.transitions().iter().map(|t| t.to).collect()
}

#[tokio::test]
async fn test_connect_then_ready() {
    let upstream = MockUpstream::new();
    let gateway = test_gateway(&upstream);
    assert_eq!(gateway.state(), GatewayState::Disconnected);

    gateway.connect().await.unwrap();
    assert_eq!(gateway.state(), GatewayState::Connected);

    // Connecting twice is a no-op.
    gateway.connect().await.unwrap();

    gateway.ensure_ready().await.unwrap();
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_eq!(
        states(&gateway),
        vec![
            GatewayState::Connecting,
            GatewayState::Connected,
            GatewayState::LoadingModels,
            GatewayState::Ready,
        ]
    );
    assert_only_table_edges(&gateway);
}

#[tokio::test]
async fn test_models_already_loaded_skips_load() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = test_gateway(&upstream);

    gateway.ensure_ready().await.unwrap();

    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_eq!(upstream.load_calls(), 0);
    assert!(!states(&gateway).contains(&GatewayState::LoadingModels));
}

#[tokio::test]
async fn test_connect_failure_degrades() {
    let upstream = MockUpstream::new();
    let (gateway, connector) = test_gateway_with(&upstream, test_config());
    connector.refuse_next(1);

    let err = gateway.connect().await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Transport {
            kind: TransportFailure::Refused,
            ..
        }
    ));
    assert_eq!(gateway.state(), GatewayState::Degraded);

    // Degraded fails fast until reconnect.
    assert!(matches!(
        gateway.connect().await.unwrap_err(),
        GatewayError::Unavailable(_)
    ));
    assert!(matches!(
        gateway.ensure_ready().await.unwrap_err(),
        GatewayError::Unavailable(_)
    ));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn test_reconnect_recovers_from_degraded() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let (gateway, connector) = test_gateway_with(&upstream, test_config());
    connector.refuse_next(1);
    let _ = gateway.connect().await;
    assert_eq!(gateway.state(), GatewayState::Degraded);

    let report = gateway.reconnect().await.unwrap();
    assert_eq!(report.status, "connected");
    assert!(report.models_loaded);
    assert_eq!(report.message, "Reconnected successfully");
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_only_table_edges(&gateway);
}

#[tokio::test]
async fn test_reconnect_from_degraded_goes_straight_to_connecting() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let (gateway, connector) = test_gateway_with(&upstream, test_config());
    connector.refuse_next(1);
    let _ = gateway.connect().await;

    gateway.reconnect().await.unwrap();

    assert_eq!(
        path(&gateway),
        vec![
            (Disconnected, Connecting),
            (Connecting, Degraded),
            (Degraded, Connecting),
            (Connecting, Connected),
            (Connected, Ready),
        ]
    );
}

#[tokio::test]
async fn test_reconnect_from_ready_passes_through_disconnected() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = test_gateway(&upstream);
    gateway.ensure_ready().await.unwrap();
    let before = gateway.transitions().len();

    gateway.reconnect().await.unwrap();

    assert_eq!(
        path(&gateway)[before..],
        [
            (Ready, Disconnected),
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Ready),
        ]
    );
    assert_eq!(upstream.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_reconnect_refused_reports_error() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let (gateway, connector) = test_gateway_with(&upstream, test_config());
    gateway.ensure_ready().await.unwrap();

    connector.refuse_next(1);
    let err = gateway.reconnect().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(gateway.state(), GatewayState::Degraded);

    // A second reconnect goes through.
    gateway.reconnect().await.unwrap();
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_only_table_edges(&gateway);
}

#[tokio::test]
async fn test_reconnect_reports_failed_load() {
    let upstream = MockUpstream::new().with_load_outcome(LoadOutcome::Reject);
    let gateway = test_gateway(&upstream);
    gateway.connect().await.unwrap();

    let report = gateway.reconnect().await.unwrap();
    assert!(!report.models_loaded);
    assert!(report.message.starts_with("Connected, but models failed to load"));
    assert_eq!(gateway.state(), GatewayState::Connected);
}

#[tokio::test]
async fn test_reconnect_is_idempotent() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = test_gateway(&upstream);

    for _ in 0..3 {
        let report = gateway.reconnect().await.unwrap();
        assert!(report.models_loaded);
        assert_eq!(gateway.state(), GatewayState::Ready);
    }
    assert_only_table_edges(&gateway);
}

#[tokio::test]
async fn test_mixed_connect_reconnect_sequences_follow_table() {
    let upstream = MockUpstream::new();
    let (gateway, connector) = test_gateway_with(&upstream, test_config());

    gateway.connect().await.unwrap();
    gateway.ensure_ready().await.unwrap();
    upstream.restart();
    let _ = gateway.health().await;
    assert_eq!(gateway.state(), GatewayState::Degraded);

    connector.refuse_next(2);
    assert!(gateway.reconnect().await.is_err());
    assert!(gateway.reconnect().await.is_err());
    gateway.reconnect().await.unwrap();
    gateway.disconnect().await;
    gateway.connect().await.unwrap();
    gateway.ensure_ready().await.unwrap();

    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_only_table_edges(&gateway);

    // Ready is only ever entered from Connected or LoadingModels.
    for t in gateway.transitions() {
        if t.to == GatewayState::Ready {
            assert!(matches!(
                t.from,
                GatewayState::Connected | GatewayState::LoadingModels
            ));
        }
    }
}

#[tokio::test]
async fn test_disconnect_says_goodbye() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = test_gateway(&upstream);
    gateway.ensure_ready().await.unwrap();

    gateway.disconnect().await;

    assert_eq!(gateway.state(), GatewayState::Disconnected);
    assert_eq!(upstream.disconnect_calls(), 1);
    assert!(!upstream.is_alive());

    // Disconnecting again does nothing.
    gateway.disconnect().await;
    assert_eq!(upstream.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_state_subscription() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = test_gateway(&upstream);
    let mut rx = gateway.subscribe_state();

    gateway.ensure_ready().await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), GatewayState::Ready);
}
