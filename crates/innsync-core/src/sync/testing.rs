//! Wiring for tests: in-memory store, in-memory PMS and a scripted channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};

use super::SyncEnv;
use crate::channel::testing::ScriptedTransport;
use crate::channel::{BackoffPolicy, ChannelClient, StaticToken};
use crate::config::{PropertyDirectory, SyncSettings};
use crate::mapper::{GenericMapper, GenericRouter};
use crate::models::{Origin, Reservation, ReservationStatus};
use crate::pms::InMemoryPms;
use crate::services::SyncStore;
use crate::Result;

pub const PROPERTY: &str = "p1";
pub const EXTERNAL_PROPERTY: &str = "H-1";

/// Defaults with short timeouts and a generous rate limit
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        request_timeout: Duration::from_secs(2),
        rate_limit_per_window: 1_000,
        rate_limit_window: Duration::from_secs(1),
        rate_limit_max_wait: Duration::from_secs(5),
        http_max_attempts: 3,
        retry_base: Duration::from_secs(1),
        retry_max: Duration::from_secs(10),
        outbound_workers: 2,
        outbound_max_attempts: 3,
        ..SyncSettings::default()
    }
}

pub struct TestHarness {
    pub env: SyncEnv,
    pub pms: Arc<InMemoryPms>,
    pub transport: Arc<ScriptedTransport>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        Self::build(ScriptedTransport::new(), fast_settings()).await
    }

    pub async fn build(transport: ScriptedTransport, settings: SyncSettings) -> Result<Self> {
        let store = SyncStore::open_in_memory().await?;
        let pms = Arc::new(InMemoryPms::new());
        let transport = Arc::new(transport);
        let channel = ChannelClient::new(
            transport.clone(),
            Arc::new(StaticToken::new("test-token")),
            Arc::new(GenericRouter),
            &settings,
        )
        .with_backoff(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            settings.http_max_attempts,
        ));
        let env = SyncEnv::new(
            store,
            pms.clone(),
            Arc::new(channel),
            Arc::new(GenericMapper),
            settings,
            PropertyDirectory::default().with(PROPERTY, EXTERNAL_PROPERTY),
        );
        Ok(Self {
            env,
            pms,
            transport,
        })
    }

    pub fn store(&self) -> &SyncStore {
        &self.env.store
    }
}

pub fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap_or_default()
}

/// Confirmed two-night stay, 360.00 EUR
pub fn local_reservation(id: &str, origin: Origin) -> Reservation {
    let now = Utc::now();
    Reservation {
        id: id.to_string(),
        property_id: PROPERTY.to_string(),
        guest_id: None,
        room_type_id: None,
        status: ReservationStatus::Confirmed,
        check_in: date("2025-01-29"),
        check_out: date("2025-01-31"),
        adults: 2,
        children: 0,
        total_amount_cents: 36_000,
        currency: "EUR".to_string(),
        origin,
        channel_code: None,
        notes: None,
        created_at: now,
        updated_at: now,
    }
}

/// Wire form of the same stay as [`local_reservation`]
pub fn wire_reservation(external_id: &str) -> Value {
    json!({
        "id": external_id,
        "property_id": EXTERNAL_PROPERTY,
        "status": "confirmed",
        "arrival": "2025-01-29",
        "departure": "2025-01-31",
        "adults": 2,
        "children": 0,
        "total": {"amount": "360.00", "currency": "EUR"},
        "channel": "booking_com",
        "customer": {
            "id": format!("C-{external_id}"),
            "first_name": "Ada",
            "last_name": "Lovelace",
            "email": "ada@example.com",
            "phone": "+44 20 7946 0000"
        }
    })
}
