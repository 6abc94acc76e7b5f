//! Webhook intake through a running sync context.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use innsync_core::db::LogFilter;
use innsync_core::sync::testing::{wire_reservation, TestHarness};
use innsync_core::sync::{sign_payload, WebhookAck, WebhookError};
use innsync_core::SyncContext;
use pretty_assertions::assert_eq;

const SECRET: &[u8] = b"whsec_integration";

async fn wait_processed(context: &SyncContext, event_id: &str) {
    for _ in 0..200 {
        let event = context
            .store()
            .get_webhook_event(event_id)
            .await
            .unwrap()
            .unwrap();
        if event.processed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("webhook {event_id} was never processed");
}

#[tokio::test(flavor = "multi_thread")]
async fn redelivered_event_mutates_nothing() {
    let harness = TestHarness::new().await.unwrap();
    let context = SyncContext::start(harness.env.clone(), SECRET);
    let body = serde_json::to_vec(&json!({
        "event_id": "evt-100",
        "event_type": "reservation.created",
        "property_id": "H-1",
        "data": wire_reservation("BK-100"),
    }))
    .unwrap();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign_payload(SECRET, &timestamp, &body).unwrap();

    let ack = context
        .webhooks()
        .receive(Some(&signature), Some(&timestamp), &body)
        .await
        .unwrap();
    assert_eq!(ack, WebhookAck::Accepted);
    wait_processed(&context, "evt-100").await;

    let writes = harness.pms.write_count();
    let filter = LogFilter {
        limit: 100,
        ..LogFilter::default()
    };
    let logged = context.store().list_logs(&filter).await.unwrap().len();
    assert_eq!(logged, 1);

    for _ in 0..3 {
        let ack = context
            .webhooks()
            .receive(Some(&signature), Some(&timestamp), &body)
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Duplicate);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.pms.write_count(), writes);
    assert_eq!(context.store().list_logs(&filter).await.unwrap().len(), logged);
    assert_eq!(harness.pms.reservations().len(), 1);
    context.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_signature_outside_window_is_refused() {
    let harness = TestHarness::new().await.unwrap();
    let context = SyncContext::start(harness.env.clone(), SECRET);
    let body = br#"{"event_id":"evt-old","event_type":"reservation.created"}"#;
    let timestamp = (Utc::now().timestamp() - 3_600).to_string();
    let signature = sign_payload(SECRET, &timestamp, body).unwrap();

    let result = context
        .webhooks()
        .receive(Some(&signature), Some(&timestamp), body)
        .await;
    assert!(matches!(result, Err(WebhookError::StaleTimestamp)));
    assert!(context
        .store()
        .get_webhook_event("evt-old")
        .await
        .unwrap()
        .is_none());
    context.shutdown();
}
