//! Chat streaming, cancellation and fault handling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use superbridge_gateway::{ErrorCategory, GatewayError, GatewayState};
use superbridge_test::prelude::*;

async fn ready_gateway(upstream: &MockUpstream) -> Gateway {
    let gateway = test_gateway(upstream);
    gateway.ensure_ready().await.unwrap();
    gateway
}

#[tokio::test]
async fn test_chat_streams_chunks_in_order() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("Hel").chunk("").chunk("lo"));
    let gateway = test_gateway(&upstream);

    // First use connects and readies on its own.
    let stream = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.session_id(), SessionId::new(42));
    assert!(stream.call_id().is_some());

    assert_eq!(stream.collect_text().await.unwrap(), "Hello");
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert!(gateway.in_flight().is_empty());

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].session_id, 42);
    assert_eq!(requests[0].prompt, "hi");
    assert_eq!(requests[0].name, TEST_CLIENT_LABEL);
}

#[tokio::test]
async fn test_chat_on_unloaded_models_loads_first() {
    let upstream = MockUpstream::new();
    let gateway = test_gateway(&upstream);

    let text = gateway
        .chat(test_session(7), "hi", CancellationToken::new())
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();

    assert_eq!(text, "ok");
    assert_eq!(upstream.load_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_stream_without_degrading() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(
        42,
        ChatScript::new()
            .chunk("a")
            .chunk_after(Duration::from_secs(1), "b")
            .chunk_after(Duration::from_secs(1), "c"),
    );
    let gateway = ready_gateway(&upstream).await;
    let cancel = CancellationToken::new();

    let mut stream = gateway
        .chat(test_session(42), "hi", cancel.clone())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");

    cancel.cancel();
    assert!(stream.next().await.is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(stream.next().await.is_none());
    assert_eq!(upstream.streams_dropped(), 1);
    assert!(gateway.in_flight().is_empty());
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert!(gateway.health().await.last_call_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_stream_aborts_upstream_call() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    let gateway = ready_gateway(&upstream).await;

    let mut stream = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    assert_eq!(gateway.in_flight().len(), 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(upstream.streams_dropped(), 1);
    assert!(gateway.in_flight().is_empty());
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test]
async fn test_disconnect_releases_stream_of_stalled_reader() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let mut script = ChatScript::new();
    for i in 0..10 {
        script = script.chunk(format!("c{i}"));
    }
    upstream.script_session(42, script.ending(StreamEnd::Hang));
    let mut config = test_config();
    config.chat.buffer_chunks = 1;
    let (gateway, _connector) = test_gateway_with(&upstream, config);
    gateway.ensure_ready().await.unwrap();

    let mut stream = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "c0");
    // Let the relay fill the pipe and block on the next send.
    tokio::time::sleep(Duration::from_millis(50)).await;

    gateway.disconnect().await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while upstream.streams_dropped() < upstream.streams_opened() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(upstream.streams_opened(), 1);
    assert!(gateway.in_flight().is_empty());

    // Buffered text is still readable, then the abort is reported.
    assert_eq!(stream.next().await.unwrap().unwrap(), "c1");
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Aborted);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_cancelled_before_start_is_empty() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let gateway = ready_gateway(&upstream).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut stream = gateway.chat(test_session(42), "hi", cancel).await.unwrap();

    assert!(stream.next().await.is_none());
    assert!(stream.call_id().is_none());
    assert_eq!(upstream.streams_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_models_load_is_clean() {
    let upstream = MockUpstream::new().with_load_delay(Duration::from_secs(30));
    let gateway = test_gateway(&upstream);
    let cancel = CancellationToken::new();

    let call = {
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { gateway.chat(test_session(42), "hi", cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();

    let mut stream = call.await.unwrap().unwrap();
    assert!(stream.next().await.is_none());
    assert_eq!(upstream.streams_opened(), 0);

    // The load itself carries on for other callers.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(gateway.state(), GatewayState::Ready);
    assert_eq!(upstream.load_calls(), 1);
}

#[tokio::test]
async fn test_mid_stream_disconnect_degrades_then_reconnect_restores() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(
        42,
        ChatScript::new()
            .chunk("partial")
            .ending(StreamEnd::TransportDrop),
    );
    let gateway = ready_gateway(&upstream).await;

    let mut stream = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Transport);
    assert!(stream.next().await.is_none());

    assert_eq!(gateway.state(), GatewayState::Degraded);
    let health = gateway.health().await;
    assert_eq!(
        health.last_call_error.as_ref().map(|e| e.category),
        Some(ErrorCategory::Transport)
    );

    // Fail fast while degraded.
    let err = gateway
        .chat(test_session(42), "again", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));

    gateway.reconnect().await.unwrap();
    gateway.ensure_ready().await.unwrap();
    assert_eq!(gateway.state(), GatewayState::Ready);

    let text = gateway
        .chat(test_session(42), "again", CancellationToken::new())
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn test_upstream_restart_requires_reload() {
    let upstream = MockUpstream::new();
    let gateway = ready_gateway(&upstream).await;
    assert_eq!(upstream.load_calls(), 1);

    upstream.restart();
    let err = gateway
        .chat(test_session(1), "hi", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(gateway.state(), GatewayState::Degraded);

    let report = gateway.reconnect().await.unwrap();
    assert!(report.models_loaded);
    assert_eq!(upstream.load_calls(), 2);
}

#[tokio::test]
async fn test_transport_fault_aborts_other_streams() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    upstream.script_session(43, ChatScript::new().chunk("b").ending(StreamEnd::Hang));
    let gateway = ready_gateway(&upstream).await;

    let mut first = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    let mut second = gateway
        .chat(test_session(43), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.next().await.unwrap().unwrap(), "a");
    assert_eq!(second.next().await.unwrap().unwrap(), "b");

    upstream.kill();

    for stream in [&mut first, &mut second] {
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::Transport);
        assert!(stream.next().await.is_none());
    }
    assert_eq!(gateway.state(), GatewayState::Degraded);
    assert!(gateway.in_flight().is_empty());
}

#[tokio::test]
async fn test_remote_error_is_per_call() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(
        42,
        ChatScript::new()
            .chunk("a")
            .ending(StreamEnd::RemoteError("session locked".into())),
    );
    let gateway = ready_gateway(&upstream).await;

    let err = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Remote);
    assert!(err.message.contains("session locked"));
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stream_times_out_per_call() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    let gateway = ready_gateway(&upstream).await;

    let err = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap_err();

    assert_eq!(err.category, ErrorCategory::Timeout);
    assert_eq!(gateway.state(), GatewayState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_interleave_but_keep_own_order() {
    let upstream = MockUpstream::new().with_models_ready(true);
    let ms = Duration::from_millis;
    upstream.script_session(
        42,
        ChatScript::new()
            .chunk_after(ms(10), "a1")
            .chunk_after(ms(20), "a2")
            .chunk_after(ms(20), "a3"),
    );
    upstream.script_session(
        43,
        ChatScript::new()
            .chunk_after(ms(20), "b1")
            .chunk_after(ms(20), "b2")
            .chunk_after(ms(20), "b3"),
    );
    let gateway = ready_gateway(&upstream).await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));

    let drain = |session: i64| {
        let gateway = gateway.clone();
        let arrivals = Arc::clone(&arrivals);
        async move {
            let mut stream = gateway
                .chat(test_session(session), "hi", CancellationToken::new())
                .await
                .unwrap();
            let mut own = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.unwrap();
                arrivals.lock().unwrap().push(chunk.clone());
                own.push(chunk);
            }
            own
        }
    };

    let (a, b) = tokio::join!(drain(42), drain(43));

    assert_eq!(a, vec!["a1", "a2", "a3"]);
    assert_eq!(b, vec!["b1", "b2", "b3"]);

    let arrivals = arrivals.lock().unwrap().clone();
    let pos = |chunk: &str| arrivals.iter().position(|c| c == chunk).unwrap();
    assert!(pos("b1") < pos("a3"), "streams did not interleave: {arrivals:?}");
}

#[tokio::test]
async fn test_busy_when_queue_full() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    let mut config = test_config();
    config.chat.max_concurrent = 1;
    config.chat.queue_depth = 0;
    let (gateway, _connector) = test_gateway_with(&upstream, config);
    gateway.ensure_ready().await.unwrap();

    let held = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();

    let err = gateway
        .chat(test_session(43), "hi", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Busy { in_flight: 1, .. }));

    drop(held);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let text = gateway
        .chat(test_session(43), "hi", CancellationToken::new())
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(text, "ok");
}

#[tokio::test]
async fn test_queued_caller_runs_when_slot_frees() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    let mut config = test_config();
    config.chat.max_concurrent = 1;
    config.chat.queue_depth = 4;
    let (gateway, _connector) = test_gateway_with(&upstream, config);
    gateway.ensure_ready().await.unwrap();

    let held = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();

    let waiting = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .chat(test_session(43), "hi", CancellationToken::new())
                .await
                .unwrap()
                .collect_text()
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.queued(), 1);

    held.cancel();
    assert_eq!(waiting.await.unwrap().unwrap(), "ok");
    assert_eq!(gateway.queued(), 0);
}

#[tokio::test]
async fn test_disconnect_aborts_in_flight_calls() {
    let upstream = MockUpstream::new().with_models_ready(true);
    upstream.script_session(42, ChatScript::new().chunk("a").ending(StreamEnd::Hang));
    let gateway = ready_gateway(&upstream).await;

    let mut stream = gateway
        .chat(test_session(42), "hi", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");

    gateway.disconnect().await;

    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.category, ErrorCategory::Aborted);
    assert!(stream.next().await.is_none());
    assert!(gateway.in_flight().is_empty());
    assert_eq!(gateway.state(), GatewayState::Disconnected);
}
