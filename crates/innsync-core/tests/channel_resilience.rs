//! Rate limit and circuit breaker behaviour through the full channel client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;

use innsync_core::channel::testing::ScriptedTransport;
use innsync_core::channel::{
    BackoffPolicy, ChannelClient, ChannelError, ChannelOperation, CircuitState, StaticToken,
};
use innsync_core::config::SyncSettings;
use innsync_core::mapper::GenericRouter;

fn client(transport: &Arc<ScriptedTransport>, settings: &SyncSettings) -> Arc<ChannelClient> {
    let client = ChannelClient::new(
        transport.clone(),
        Arc::new(StaticToken::new("token")),
        Arc::new(GenericRouter),
        settings,
    )
    .with_backoff(BackoffPolicy::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        settings.http_max_attempts,
    ));
    Arc::new(client)
}

fn fetch(id: usize) -> ChannelOperation {
    ChannelOperation::FetchReservation {
        external_property_id: "H-1".to_string(),
        external_id: format!("BK-{id}"),
    }
}

#[tokio::test(start_paused = true)]
async fn no_window_exceeds_the_configured_rate() {
    let settings = SyncSettings {
        rate_limit_per_window: 5,
        rate_limit_window: Duration::from_secs(1),
        rate_limit_max_wait: Duration::from_secs(30),
        ..SyncSettings::default()
    };
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport, &settings);

    let mut calls = JoinSet::new();
    for id in 0..23 {
        let client = client.clone();
        calls.spawn(async move { client.call(&fetch(id), None).await });
    }
    while let Some(result) = calls.join_next().await {
        result.unwrap().unwrap();
    }

    let sent = transport.sent_at();
    assert_eq!(sent.len(), 23);
    for (i, start) in sent.iter().enumerate() {
        let in_window = sent[i..]
            .iter()
            .filter(|at| at.duration_since(*start) < Duration::from_secs(1))
            .count();
        assert!(in_window <= 5, "{in_window} dispatches inside one window");
    }
    let health = client.health();
    assert_eq!(health.rate_limiter.dispatched_total, 23);
    assert!(health.rate_limiter.waited_total > 0);
}

#[tokio::test(start_paused = true)]
async fn caller_past_max_wait_is_throttled() {
    let settings = SyncSettings {
        rate_limit_per_window: 1,
        rate_limit_window: Duration::from_secs(60),
        rate_limit_max_wait: Duration::from_secs(1),
        ..SyncSettings::default()
    };
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport, &settings);

    client.call(&fetch(1), None).await.unwrap();
    let error = client.call(&fetch(2), None).await.unwrap_err();
    assert!(matches!(error, ChannelError::Throttled(_)));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_short_circuits_then_recovers() {
    let settings = SyncSettings {
        circuit_failure_threshold: 3,
        circuit_cooldown: Duration::from_secs(30),
        http_max_attempts: 1,
        ..SyncSettings::default()
    };
    let transport = Arc::new(ScriptedTransport::new().with_fallback(200, json!({"id": "BK-1"})));
    for _ in 0..3 {
        transport.push_status(503, json!({"error": "maintenance"}));
    }
    let client = client(&transport, &settings);

    for id in 0..3 {
        let error = client.call(&fetch(id), None).await.unwrap_err();
        assert!(matches!(error, ChannelError::Server { status: 503, .. }));
    }
    assert_eq!(client.health().circuit.state, CircuitState::Open);

    let error = client.call(&fetch(3), None).await.unwrap_err();
    assert!(matches!(error, ChannelError::CircuitOpen));
    assert_eq!(transport.request_count(), 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    client.call(&fetch(4), None).await.unwrap();
    assert_eq!(client.health().circuit.state, CircuitState::Closed);
    assert_eq!(transport.request_count(), 4);
}
