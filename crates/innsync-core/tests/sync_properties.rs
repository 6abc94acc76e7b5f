//! End-to-end behaviour of the sync services against an in-memory PMS and a
//! scripted channel.

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use innsync_core::channel::testing::ScriptedTransport;
use innsync_core::db::LogFilter;
use innsync_core::mapper::local_reservation_hash;
use innsync_core::models::{
    ChangeEntity, ChangeEvent, ChangeOperation, ConflictType, EntityType, NewMapping, Origin,
    Reservation, ReservationStatus, ResolutionAction, ResolutionStrategy, SyncDirection,
    SyncLog, SyncOperation, SyncType,
};
use innsync_core::sync::testing::{
    fast_settings, local_reservation, wire_reservation, TestHarness, EXTERNAL_PROPERTY, PROPERTY,
};
use innsync_core::sync::{
    apply_reservation, process_job, run_manual, ApplyMode, ItemOutcome, JobOutcome, OutboundJob,
};
use innsync_core::Error;
use pretty_assertions::assert_eq;

async fn logs(harness: &TestHarness) -> Vec<SyncLog> {
    harness
        .store()
        .list_logs(&LogFilter {
            limit: 100,
            ..LogFilter::default()
        })
        .await
        .unwrap()
}

fn mapping(local_id: &str, external_id: &str, local_hash: Option<String>) -> NewMapping {
    NewMapping {
        property_id: PROPERTY.to_string(),
        entity_type: EntityType::Reservation,
        local_id: local_id.to_string(),
        external_id: external_id.to_string(),
        external_property_id: EXTERNAL_PROPERTY.to_string(),
        sync_direction: SyncDirection::Bidirectional,
        local_hash,
        external_hash: None,
        match_method: None,
        match_confidence: None,
    }
}

async fn mapped(harness: &TestHarness, local: Reservation, external_id: &str) {
    let hash = local_reservation_hash(&local).unwrap();
    harness.pms.insert_reservation(local.clone());
    harness
        .store()
        .create_mapping(mapping(&local.id, external_id, Some(hash)), true)
        .await
        .unwrap();
}

fn created(local_id: &str) -> ChangeEvent {
    ChangeEvent {
        property_id: PROPERTY.to_string(),
        entity: ChangeEntity::Reservation,
        entity_id: local_id.to_string(),
        operation: ChangeOperation::Created,
        occurred_at: Utc::now(),
        range: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn active_mappings_are_unique_on_both_sides() {
    let harness = TestHarness::new().await.unwrap();
    let store = harness.store();
    let first = store
        .create_mapping(mapping("r-1", "BK-1", None), true)
        .await
        .unwrap();

    let same_local = store.create_mapping(mapping("r-1", "BK-2", None), true).await;
    assert!(matches!(same_local, Err(Error::AlreadyExists(_))));
    let same_external = store.create_mapping(mapping("r-2", "BK-1", None), true).await;
    assert!(matches!(same_external, Err(Error::AlreadyExists(_))));

    store.retire_mapping(&first.id).await.unwrap();
    store
        .create_mapping(mapping("r-1", "BK-1", None), true)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_triggers_run_once() {
    let transport = ScriptedTransport::new()
        .with_fallback(200, json!({"data": [], "has_more": false}))
        .with_latency(std::time::Duration::from_millis(100));
    let harness = TestHarness::build(transport, fast_settings()).await.unwrap();

    let mut triggers = JoinSet::new();
    for _ in 0..8 {
        let env = harness.env.clone();
        triggers.spawn(async move { run_manual(&env, PROPERTY, SyncType::Reservations).await });
    }
    let mut ran = 0;
    while let Some(result) = triggers.join_next().await {
        if result.unwrap().unwrap().is_some() {
            ran += 1;
        }
    }
    assert_eq!(ran, 1);
    assert_eq!(
        harness
            .store()
            .count_running(PROPERTY, SyncType::Reservations)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn new_local_booking_is_pushed_and_mapped() {
    let transport = ScriptedTransport::new();
    transport.push_status(201, json!({"id": "BK-77"}));
    let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
    harness
        .pms
        .insert_reservation(local_reservation("r-7", Origin::Pms));

    let outcome = process_job(&harness.env, OutboundJob::from(created("r-7"))).await;
    assert_eq!(outcome, JobOutcome::Delivered);

    let mapping = harness
        .store()
        .find_mapping_by_local(PROPERTY, EntityType::Reservation, "r-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.external_id, "BK-77");
    assert!(mapping.last_synced_at.is_some());

    let logs = logs(&harness).await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
    assert_eq!(logs[0].operation, SyncOperation::Create);
    assert_eq!(logs[0].external_id.as_deref(), Some("BK-77"));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_retried_into_one_success_log() {
    let transport = ScriptedTransport::new();
    transport.push_status(503, json!({"error": "busy"}));
    transport.push_status(503, json!({"error": "busy"}));
    transport.push_status(201, json!({"id": "BK-8"}));
    let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
    harness
        .pms
        .insert_reservation(local_reservation("r-8", Origin::Pms));

    let outcome = process_job(&harness.env, OutboundJob::from(created("r-8"))).await;
    assert_eq!(outcome, JobOutcome::Delivered);
    assert_eq!(harness.transport.request_count(), 3);

    let logs = logs(&harness).await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_cancellation_auto_resolves_to_remote() {
    let harness = TestHarness::new().await.unwrap();
    mapped(&harness, local_reservation("r-1", Origin::Channel), "BK-1").await;
    let mut raw = wire_reservation("BK-1");
    raw["status"] = Value::String("cancelled".into());

    let outcome = apply_reservation(&harness.env, PROPERTY, None, &raw, ApplyMode::Detect)
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::AutoResolved);
    assert_eq!(
        harness.pms.reservation("r-1").unwrap().status,
        ReservationStatus::Cancelled
    );

    let history = harness
        .store()
        .conflict_history(PROPERTY, EntityType::Reservation, "BK-1")
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].conflict_type, ConflictType::Status);
    assert_eq!(history[0].resolution_strategy, ResolutionStrategy::Auto);
    assert_eq!(
        history[0].resolution_action,
        Some(ResolutionAction::AcceptRemote)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn large_amount_difference_waits_for_an_operator() {
    let harness = TestHarness::new().await.unwrap();
    let mut local = local_reservation("r-2", Origin::Pms);
    local.total_amount_cents = 10_000;
    mapped(&harness, local.clone(), "BK-2").await;
    let mut raw = wire_reservation("BK-2");
    raw["total"]["amount"] = Value::String("120.00".into());

    let outcome = apply_reservation(&harness.env, PROPERTY, None, &raw, ApplyMode::Detect)
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Held);
    assert_eq!(harness.pms.reservation("r-2").unwrap(), local);

    let open = harness
        .store()
        .list_open_conflicts(Some(PROPERTY), 10)
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].conflict_type, ConflictType::Amount);
    assert_eq!(open[0].resolution_strategy, ResolutionStrategy::Manual);
    assert_eq!(open[0].local_snapshot["total_amount_cents"], 10_000);
    assert_eq!(open[0].remote_snapshot, raw);
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_echo_does_not_bounce_back() {
    let transport = ScriptedTransport::new();
    transport.push_status(201, json!({"id": "BK-5"}));
    let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
    harness
        .pms
        .insert_reservation(local_reservation("r-5", Origin::Pms));
    process_job(&harness.env, OutboundJob::from(created("r-5"))).await;
    let writes = harness.pms.write_count();

    // The channel reports our own booking back on the next pull.
    let mut echoed = harness.transport.requests()[0].body.clone().unwrap();
    echoed["id"] = Value::String("BK-5".into());
    let outcome = apply_reservation(&harness.env, PROPERTY, None, &echoed, ApplyMode::Detect)
        .await
        .unwrap();
    assert_eq!(outcome, ItemOutcome::Unchanged);
    assert_eq!(harness.pms.write_count(), writes);
}
