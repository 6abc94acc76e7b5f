//! Webhook intake and processing.
//!
//! Intake verifies the signature, records the event under its partner id and
//! acknowledges right away. Processing happens on a background task; events
//! it could not finish are picked up again by [`sweep_unprocessed`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::apply::{apply_guest, apply_reservation, ApplyMode};
use super::{ItemOutcome, SyncEnv};
use crate::channel::ChannelOperation;
use crate::mapper::{ChannelMapper, WebhookSubject};
use crate::models::WebhookEvent;
use crate::services::SyncStore;
use crate::util::compact_text;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Deliveries older or newer than this are rejected as replays
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Processing attempts before the sweeper leaves an event alone
pub const MAX_WEBHOOK_ATTEMPTS: u32 = 5;

/// How long one worker owns an event before another may take it over
pub const WEBHOOK_CLAIM_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature or timestamp header")]
    MissingSignature,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Storage(#[from] Error),
}

fn mac(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
) -> std::result::Result<HmacSha256, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// `sha256=<hex>` over `"{timestamp}.{body}"`
pub fn sign_payload(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
) -> std::result::Result<String, WebhookError> {
    let digest = mac(secret, timestamp, body)?.finalize().into_bytes();
    Ok(format!("sha256={}", hex::encode(digest)))
}

/// Constant-time check of a `sha256=<hex>` (or bare hex) signature
pub fn verify_signature(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> std::result::Result<(), WebhookError> {
    let signature = signature.trim();
    let encoded = signature.strip_prefix("sha256=").unwrap_or(signature);
    let provided = hex::decode(encoded).map_err(|_| WebhookError::InvalidSignature)?;
    mac(secret, timestamp, body)?
        .verify_slice(&provided)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn check_timestamp(timestamp: &str, now: DateTime<Utc>) -> std::result::Result<(), WebhookError> {
    let seconds: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| WebhookError::StaleTimestamp)?;
    let sent = DateTime::from_timestamp(seconds, 0).ok_or(WebhookError::StaleTimestamp)?;
    if (now - sent).num_seconds().abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::StaleTimestamp);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAck {
    /// First delivery, queued for processing
    Accepted,
    /// Already processed; nothing to do
    Duplicate,
    /// Seen before but not yet processed; queued again
    Requeued,
}

#[derive(Clone)]
pub struct WebhookIntake {
    store: SyncStore,
    mapper: Arc<dyn ChannelMapper>,
    secret: Arc<[u8]>,
    tx: mpsc::Sender<String>,
}

impl std::fmt::Debug for WebhookIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIntake")
            .field("secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl WebhookIntake {
    pub fn new(env: &SyncEnv, secret: &[u8], tx: mpsc::Sender<String>) -> Self {
        Self {
            store: env.store.clone(),
            mapper: Arc::clone(&env.mapper),
            secret: Arc::from(secret),
            tx,
        }
    }

    pub async fn receive(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> std::result::Result<WebhookAck, WebhookError> {
        self.receive_at(signature, timestamp, body, Utc::now()).await
    }

    pub async fn receive_at(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> std::result::Result<WebhookAck, WebhookError> {
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return Err(WebhookError::MissingSignature);
        };
        verify_signature(&self.secret, timestamp, body, signature)?;
        check_timestamp(timestamp, now)?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|error| WebhookError::MalformedPayload(error.to_string()))?;
        let (event_id, event_type) = self
            .mapper
            .webhook_envelope(&payload)
            .map_err(|error| WebhookError::MalformedPayload(error.to_string()))?;

        if let Some(existing) = self.store.get_webhook_event(&event_id).await? {
            if existing.processed {
                tracing::debug!(event_id = %event_id, "Duplicate webhook acknowledged");
                return Ok(WebhookAck::Duplicate);
            }
            self.dispatch(event_id);
            return Ok(WebhookAck::Requeued);
        }

        let inserted = self
            .store
            .insert_webhook_event(&WebhookEvent::received(
                event_id.clone(),
                event_type.clone(),
                payload,
            ))
            .await?;
        tracing::info!(event_id = %event_id, event_type = %event_type, "Webhook received");
        self.dispatch(event_id);
        Ok(if inserted {
            WebhookAck::Accepted
        } else {
            WebhookAck::Requeued
        })
    }

    fn dispatch(&self, event_id: String) {
        if let Err(error) = self.tx.try_send(event_id) {
            // The sweeper picks up anything left unprocessed.
            tracing::debug!(error = %error, "Webhook processor busy");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied(ItemOutcome),
    Ignored,
    AlreadyProcessed,
    /// Another worker holds the processing lease
    InFlight,
    Failed(String),
}

fn property_for(env: &SyncEnv, external_property_id: Option<&str>) -> Result<String> {
    if let Some(external) = external_property_id {
        return env
            .properties
            .property_for_external(external)
            .map(ToString::to_string)
            .ok_or_else(|| Error::Validation(format!("webhook for unknown property `{external}`")));
    }
    let mut ids = env.properties.property_ids();
    match (ids.next(), ids.next()) {
        (Some(only), None) => Ok(only.to_string()),
        _ => Err(Error::Validation(
            "webhook does not name a property".to_string(),
        )),
    }
}

async fn handle(env: &SyncEnv, event: &WebhookEvent) -> Result<WebhookOutcome> {
    let notice = env
        .mapper
        .parse_webhook(&event.event_type, &event.payload)?;
    let subject = notice.subject;
    if subject == WebhookSubject::Ignored {
        return Ok(WebhookOutcome::Ignored);
    }
    if !env.settings.directions.inbound_reservations {
        tracing::debug!(event_id = %event.event_id, "Inbound flow disabled, webhook ignored");
        return Ok(WebhookOutcome::Ignored);
    }
    let property_id = property_for(env, notice.external_property_id.as_deref())?;

    let outcome = match subject {
        WebhookSubject::Reservation { external_id, data } => {
            let inline = data.filter(|data| env.mapper.reservation_from_external(data).is_ok());
            let raw = match inline {
                Some(raw) => raw,
                None => {
                    let operation = ChannelOperation::FetchReservation {
                        external_property_id: env.external_property_id(&property_id)?,
                        external_id,
                    };
                    env.channel.call(&operation, None).await?
                }
            };
            apply_reservation(env, &property_id, None, &raw, ApplyMode::Detect).await?
        }
        WebhookSubject::Guest { data } => apply_guest(env, &property_id, None, &data).await?,
        WebhookSubject::Ignored => return Ok(WebhookOutcome::Ignored),
    };
    if outcome == ItemOutcome::Failed {
        return Err(Error::Validation(
            "webhook subject could not be applied, see sync log".to_string(),
        ));
    }
    Ok(WebhookOutcome::Applied(outcome))
}

/// Process one stored event under its processing lease. Marked processed on
/// success, failed otherwise.
pub async fn process_webhook_event(env: &SyncEnv, event_id: &str) -> Result<WebhookOutcome> {
    let event = env
        .store
        .get_webhook_event(event_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("webhook event {event_id}")))?;
    if event.processed {
        return Ok(WebhookOutcome::AlreadyProcessed);
    }
    let lease = chrono::Duration::seconds(WEBHOOK_CLAIM_SECS);
    if !env
        .store
        .claim_webhook_event(event_id, Utc::now(), lease)
        .await?
    {
        tracing::debug!(event_id, "Webhook already being processed");
        return Ok(WebhookOutcome::InFlight);
    }

    match handle(env, &event).await {
        Ok(outcome) => {
            env.store.mark_webhook_processed(event_id).await?;
            tracing::info!(event_id, outcome = ?outcome, "Webhook processed");
            Ok(outcome)
        }
        Err(error) => {
            let message = compact_text(&error.to_string());
            env.store.mark_webhook_failed(event_id, &message).await?;
            tracing::warn!(
                event_id,
                attempt = event.attempts + 1,
                error = %message,
                "Webhook processing failed"
            );
            Ok(WebhookOutcome::Failed(message))
        }
    }
}

/// Background task draining the intake channel
pub fn spawn_webhook_processor(env: SyncEnv, mut rx: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event_id) = rx.recv().await {
            if let Err(error) = process_webhook_event(&env, &event_id).await {
                tracing::error!(event_id = %event_id, error = %error, "Webhook processor error");
            }
        }
    })
}

/// Retry unprocessed events that still have attempts left. Returns how many ran.
pub async fn sweep_unprocessed(env: &SyncEnv, limit: usize) -> Result<usize> {
    let pending = env.store.list_unprocessed_webhooks(limit).await?;
    let mut swept = 0;
    for event in pending
        .into_iter()
        .filter(|event| event.attempts < MAX_WEBHOOK_ATTEMPTS)
    {
        if process_webhook_event(env, &event.event_id).await? != WebhookOutcome::InFlight {
            swept += 1;
        }
    }
    if swept > 0 {
        tracing::info!(swept, "Swept unprocessed webhooks");
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ScriptedTransport;
    use crate::db::LogFilter;
    use crate::models::EntityType;
    use crate::sync::testing::{fast_settings, wire_reservation, TestHarness, PROPERTY};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SECRET: &[u8] = b"whsec_test";

    fn signed(body: &Value, now: DateTime<Utc>) -> (Vec<u8>, String, String) {
        let body = serde_json::to_vec(body).unwrap();
        let timestamp = now.timestamp().to_string();
        let signature = sign_payload(SECRET, &timestamp, &body).unwrap();
        (body, timestamp, signature)
    }

    #[test]
    fn signature_roundtrip_and_tamper() {
        let signature = sign_payload(SECRET, "1700000000", b"{}").unwrap();
        assert!(verify_signature(SECRET, "1700000000", b"{}", &signature).is_ok());
        let bare = signature.trim_start_matches("sha256=");
        assert!(verify_signature(SECRET, "1700000000", b"{}", bare).is_ok());
        assert!(matches!(
            verify_signature(SECRET, "1700000000", b"{ }", &signature),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(b"other", "1700000000", b"{}", &signature),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn timestamp_window() {
        let now = Utc::now();
        assert!(check_timestamp(&now.timestamp().to_string(), now).is_ok());
        let old = (now.timestamp() - 301).to_string();
        assert!(matches!(check_timestamp(&old, now), Err(WebhookError::StaleTimestamp)));
        assert!(check_timestamp("yesterday", now).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_delivery_is_processed_once() {
        let harness = TestHarness::new().await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let intake = WebhookIntake::new(&harness.env, SECRET, tx);
        let now = Utc::now();
        let envelope = json!({
            "event_id": "evt-1",
            "event_type": "reservation.created",
            "property_id": "H-1",
            "data": wire_reservation("BK-1"),
        });
        let (body, timestamp, signature) = signed(&envelope, now);

        let first = intake
            .receive_at(Some(&signature), Some(&timestamp), &body, now)
            .await
            .unwrap();
        assert_eq!(first, WebhookAck::Accepted);
        let queued = rx.recv().await.unwrap();
        let outcome = process_webhook_event(&harness.env, &queued).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied(ItemOutcome::Created));

        let second = intake
            .receive_at(Some(&signature), Some(&timestamp), &body, now)
            .await
            .unwrap();
        assert_eq!(second, WebhookAck::Duplicate);
        assert!(rx.try_recv().is_err());
        assert_eq!(harness.pms.reservations().len(), 1);
        assert!(harness
            .store()
            .find_mapping_by_external(PROPERTY, EntityType::Reservation, "BK-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_signature_is_rejected_without_storing() {
        let harness = TestHarness::new().await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let intake = WebhookIntake::new(&harness.env, SECRET, tx);
        let now = Utc::now();
        let (body, timestamp, _) = signed(&json!({"event_id": "evt-2", "event_type": "x"}), now);

        let err = intake
            .receive_at(Some("sha256=00"), Some(&timestamp), &body, now)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        assert!(matches!(
            intake.receive_at(None, Some(&timestamp), &body, now).await,
            Err(WebhookError::MissingSignature)
        ));
        assert!(harness.store().get_webhook_event("evt-2").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notification_without_data_fetches_the_booking() {
        let harness = TestHarness::new().await.unwrap();
        harness.transport.push_status(200, wire_reservation("BK-5"));
        let event = WebhookEvent::received(
            "evt-5",
            "reservation.modified",
            json!({"event_id": "evt-5", "property_id": "H-1", "reservation_id": "BK-5"}),
        );
        harness.store().insert_webhook_event(&event).await.unwrap();

        let outcome = process_webhook_event(&harness.env, "evt-5").await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied(ItemOutcome::Created));
        let sent = harness.transport.requests();
        assert_eq!(sent[0].path, "/properties/H-1/reservations/BK-5");
        assert!(harness
            .store()
            .get_webhook_event("evt-5")
            .await
            .unwrap()
            .unwrap()
            .processed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processor_and_sweeper_race_applies_event_once() {
        let transport = ScriptedTransport::new()
            .with_fallback(200, wire_reservation("BK-6"))
            .with_latency(std::time::Duration::from_millis(100));
        let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
        let event = WebhookEvent::received(
            "evt-6",
            "reservation.modified",
            json!({"event_id": "evt-6", "property_id": "H-1", "reservation_id": "BK-6"}),
        );
        harness.store().insert_webhook_event(&event).await.unwrap();

        let (processed, swept) = tokio::join!(
            process_webhook_event(&harness.env, "evt-6"),
            sweep_unprocessed(&harness.env, 10),
        );
        let processed = processed.unwrap();
        let swept = swept.unwrap();

        // whichever side lost the claim did no work
        assert!(
            (processed == WebhookOutcome::InFlight && swept == 1)
                || (processed == WebhookOutcome::Applied(ItemOutcome::Created) && swept == 0),
            "{processed:?} / {swept}"
        );
        assert_eq!(harness.transport.request_count(), 1);
        assert_eq!(harness.pms.reservations().len(), 1);
        let logs = harness
            .store()
            .list_logs(&LogFilter {
                property_id: Some(PROPERTY.to_string()),
                external_id: Some("BK-6".to_string()),
                limit: 10,
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        let stored = harness.store().get_webhook_event("evt-6").await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_event_is_swept_until_attempts_run_out() {
        let harness = TestHarness::new().await.unwrap();
        let event = WebhookEvent::received(
            "evt-9",
            "reservation.created",
            json!({"event_id": "evt-9", "property_id": "UNKNOWN", "reservation_id": "BK-9"}),
        );
        harness.store().insert_webhook_event(&event).await.unwrap();

        for _ in 0..MAX_WEBHOOK_ATTEMPTS {
            assert_eq!(sweep_unprocessed(&harness.env, 10).await.unwrap(), 1);
        }
        assert_eq!(sweep_unprocessed(&harness.env, 10).await.unwrap(), 0);
        let stored = harness.store().get_webhook_event("evt-9").await.unwrap().unwrap();
        assert!(!stored.processed);
        assert_eq!(stored.attempts, MAX_WEBHOOK_ATTEMPTS);
        assert!(stored.error.unwrap().contains("unknown property"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unrelated_event_types_are_acknowledged() {
        let harness = TestHarness::new().await.unwrap();
        let event = WebhookEvent::received(
            "evt-7",
            "rate_plan.updated",
            json!({"event_id": "evt-7"}),
        );
        harness.store().insert_webhook_event(&event).await.unwrap();
        let outcome = process_webhook_event(&harness.env, "evt-7").await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }
}
