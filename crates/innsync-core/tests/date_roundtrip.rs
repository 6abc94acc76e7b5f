//! Stay dates survive inbound and outbound translation on a host west of UTC.
//!
//! Kept in its own test binary because it changes the process timezone.

use chrono::{NaiveDate, Utc};
use serde_json::json;

use innsync_core::mapper::{
    format_calendar_date, parse_calendar_date, parse_instant, utc_midnight,
};
use innsync_core::models::{ChangeEntity, ChangeEvent, ChangeOperation, EntityType};
use innsync_core::sync::testing::{wire_reservation, TestHarness, PROPERTY};
use innsync_core::sync::{apply_reservation, push_change, ApplyMode, ItemOutcome, PushMode};
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread")]
async fn dates_round_trip_under_negative_offset() {
    std::env::set_var("TZ", "America/Los_Angeles");

    for raw in ["2025-01-29", "2024-02-29", "2025-12-31", "2025-03-09"] {
        let day = parse_calendar_date("arrival", raw).unwrap();
        assert_eq!(format_calendar_date(day), raw);
        assert_eq!(
            parse_instant("arrival", raw).unwrap(),
            utc_midnight(day),
            "midnight of {raw} must not drift"
        );
    }
    // An instant late in the evening west of UTC is still that calendar day.
    let evening = parse_calendar_date("arrival", "2025-01-29T23:30:00-08:00").unwrap();
    assert_eq!(evening, NaiveDate::from_ymd_opt(2025, 1, 29).unwrap());

    let harness = TestHarness::new().await.unwrap();
    let mut raw = wire_reservation("BK-TZ");
    raw["arrival"] = json!("2025-03-08");
    raw["departure"] = json!("2025-03-10");
    let outcome = apply_reservation(&harness.env, PROPERTY, None, &raw, ApplyMode::Detect)
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Created);

    let mapping = harness
        .store()
        .find_mapping_by_external(PROPERTY, EntityType::Reservation, "BK-TZ")
        .await
        .unwrap()
        .unwrap();
    let local = harness.pms.reservation(&mapping.local_id).unwrap();
    assert_eq!(local.check_in.to_string(), "2025-03-08");
    assert_eq!(local.check_out.to_string(), "2025-03-10");

    let event = ChangeEvent {
        property_id: PROPERTY.to_string(),
        entity: ChangeEntity::Reservation,
        entity_id: local.id.clone(),
        operation: ChangeOperation::Updated,
        occurred_at: Utc::now(),
        range: None,
    };
    push_change(&harness.env, &event, None, PushMode::Always)
        .await
        .unwrap();
    let sent = harness.transport.requests();
    let body = sent[0].body.as_ref().unwrap();
    assert_eq!(body["arrival"], "2025-03-08");
    assert_eq!(body["departure"], "2025-03-10");
}
