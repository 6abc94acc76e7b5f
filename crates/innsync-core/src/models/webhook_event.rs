//! Webhook idempotency record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One delivered webhook, keyed by the partner's event id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    /// Once true the row is frozen
    pub processed: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Processing lease held by one worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn received(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            processed: false,
            error: None,
            attempts: 0,
            received_at: Utc::now(),
            processed_at: None,
            claimed_until: None,
        }
    }
}
