//! Push one PMS change to the channel.

use std::time::Instant;

use chrono::{Days, Utc};
use serde_json::{json, Value};

use super::ari::{inventory_request, InventoryKind};
use super::locks::{entity_key, Side};
use super::SyncEnv;
use crate::channel::{ChannelError, ChannelOperation};
use crate::db::HashUpdate;
use crate::mapper::{local_reservation_hash, OutboundReservation};
use crate::models::{
    ChangeEntity, ChangeEvent, ChangeOperation, DateRange, Direction, EntityType, NewMapping,
    Origin, ReservationStatus, RunId, SyncDirection, SyncLog, SyncMapping, SyncOperation,
};
use crate::util::compact_text;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Skip when the local fingerprint matches the last synced one
    IfChanged,
    /// Push regardless; used when an operator keeps the local side
    Always,
}

/// A push that did not go through, with the log row describing it
#[derive(Debug)]
pub struct PushFailure {
    pub error: Error,
    pub log: SyncLog,
}

#[derive(Debug)]
struct Pushed {
    operation: SyncOperation,
    external_id: Option<String>,
    response: Option<Value>,
}

impl Pushed {
    fn skipped(external_id: Option<String>, reason: &str) -> Self {
        Self {
            operation: SyncOperation::Noop,
            external_id,
            response: Some(json!({ "skipped": reason })),
        }
    }
}

/// What has been sent so far, kept for the failure log
#[derive(Debug, Default)]
struct Trace {
    request: Option<Value>,
    external_id: Option<String>,
}

const fn log_entity(entity: ChangeEntity) -> EntityType {
    match entity {
        ChangeEntity::Reservation => EntityType::Reservation,
        ChangeEntity::RoomType | ChangeEntity::Availability | ChangeEntity::Rate => {
            EntityType::RoomType
        }
    }
}

/// Push `event` and return the log row for it.
///
/// The caller persists the row, so redelivery can decide whether a failure
/// is final before anything is written.
pub async fn push_change(
    env: &SyncEnv,
    event: &ChangeEvent,
    run_id: Option<RunId>,
    mode: PushMode,
) -> std::result::Result<SyncLog, PushFailure> {
    let started = Instant::now();
    let draft = SyncLog::new(
        event.property_id.clone(),
        Direction::Outbound,
        log_entity(event.entity),
        SyncOperation::Push,
    )
    .in_run(run_id)
    .with_local_id(Some(event.entity_id.clone()));

    let mut trace = Trace::default();
    let result = match event.entity {
        ChangeEntity::Reservation => push_reservation(env, event, mode, &mut trace).await,
        ChangeEntity::Availability => {
            push_inventory(env, event, &[InventoryKind::Availability], &mut trace).await
        }
        ChangeEntity::Rate => push_inventory(env, event, &[InventoryKind::Rates], &mut trace).await,
        ChangeEntity::RoomType => {
            push_inventory(
                env,
                event,
                &[InventoryKind::Availability, InventoryKind::Rates],
                &mut trace,
            )
            .await
        }
    };

    let mut log = draft;
    if let Some(request) = trace.request {
        log = log.with_request(request);
    }
    match result {
        Ok(pushed) => {
            let mut log = log
                .with_operation(pushed.operation)
                .with_external_id(pushed.external_id.or(trace.external_id));
            if let Some(response) = pushed.response {
                log = log.with_response(response);
            }
            Ok(log.succeeded(started.elapsed()))
        }
        Err(error) => {
            let log = log
                .with_external_id(trace.external_id)
                .failed(compact_text(&error.to_string()), started.elapsed());
            Err(PushFailure { error, log })
        }
    }
}

/// Stable per local reservation, so a create repeated after a lost response
/// or a failed mapping write resolves to the booking the channel already has.
fn create_key(property_id: &str, local_id: &str) -> String {
    format!("innsync:{property_id}:reservation:{local_id}")
}

/// Fingerprint the channel side will have once it accepts `payload`
fn projected_hash(env: &SyncEnv, payload: &Value, external_id: &str) -> Option<String> {
    let mut echoed = payload.clone();
    if let Value::Object(map) = &mut echoed {
        map.insert("id".to_string(), Value::String(external_id.to_string()));
    }
    env.mapper
        .reservation_from_external(&echoed)
        .ok()
        .and_then(|remote| remote.fingerprint().ok())
}

async fn push_reservation(
    env: &SyncEnv,
    event: &ChangeEvent,
    mode: PushMode,
    trace: &mut Trace,
) -> Result<Pushed> {
    let property_id = event.property_id.as_str();
    let local_id = event.entity_id.as_str();
    let store = &env.store;
    let external_property_id = env.external_property_id(property_id)?;

    let seen = store
        .find_mapping_by_local(property_id, EntityType::Reservation, local_id)
        .await?;
    let mut keys = vec![entity_key(
        property_id,
        EntityType::Reservation,
        Side::Local,
        local_id,
    )];
    if let Some(mapping) = &seen {
        keys.push(entity_key(
            property_id,
            EntityType::Reservation,
            Side::External,
            &mapping.external_id,
        ));
    }
    let _guard = env.locks.lock(keys).await?;

    let mapping = store
        .find_mapping_by_local(property_id, EntityType::Reservation, local_id)
        .await?;
    if mapping.as_ref().map(|m| &m.id) != seen.as_ref().map(|m| &m.id) {
        return Err(Error::StaleWrite(format!(
            "mapping for reservation {local_id} changed while waiting"
        )));
    }
    trace.external_id = mapping.as_ref().map(|m| m.external_id.clone());

    if let Some(mapping) = &mapping {
        if !mapping.sync_direction.allows_outbound() {
            return Ok(Pushed::skipped(
                trace.external_id.clone(),
                "outbound sync disabled for this mapping",
            ));
        }
    }

    let reservation = if event.operation == ChangeOperation::Deleted {
        None
    } else {
        env.pms.get_reservation(property_id, local_id).await?
    };
    let Some(reservation) = reservation else {
        return match mapping {
            Some(mapping) => retire_remote(env, &external_property_id, mapping).await,
            None => Ok(Pushed::skipped(None, "reservation gone before it was synced")),
        };
    };

    let local_hash = local_reservation_hash(&reservation)?;
    if let Some(mapping) = &mapping {
        if mode == PushMode::IfChanged && mapping.local_hash.as_deref() == Some(local_hash.as_str())
        {
            return Ok(Pushed::skipped(trace.external_id.clone(), "already in sync"));
        }
    } else if reservation.origin == Origin::Channel {
        return Ok(Pushed::skipped(
            None,
            "channel booking without mapping is left to inbound sync",
        ));
    } else if reservation.status == ReservationStatus::Cancelled {
        return Ok(Pushed::skipped(None, "cancelled before it was synced"));
    }

    let room_type_external_id = match &reservation.room_type_id {
        Some(room_type_id) => store
            .find_mapping_by_local(property_id, EntityType::RoomType, room_type_id)
            .await?
            .map(|m| m.external_id),
        None => None,
    };
    let guest = match &reservation.guest_id {
        Some(guest_id) => env.pms.get_guest(property_id, guest_id).await?,
        None => None,
    };
    let payload = env.mapper.reservation_to_external(OutboundReservation {
        reservation: &reservation,
        guest: guest.as_ref(),
        room_type_external_id: room_type_external_id.as_deref(),
    });
    trace.request = Some(payload.clone());

    match mapping {
        None => {
            let operation = ChannelOperation::PushReservation {
                external_property_id: external_property_id.clone(),
                external_id: None,
                idempotency_key: Some(create_key(property_id, local_id)),
            };
            let response = env.channel.call(&operation, Some(payload.clone())).await?;
            let external_id = env.mapper.created_external_id(&response).ok_or_else(|| {
                ChannelError::InvalidPayload("create response carried no reservation id".into())
            })?;
            trace.external_id = Some(external_id.clone());

            let new = NewMapping {
                property_id: property_id.to_string(),
                entity_type: EntityType::Reservation,
                local_id: local_id.to_string(),
                external_id: external_id.clone(),
                external_property_id,
                sync_direction: SyncDirection::Bidirectional,
                local_hash: Some(local_hash),
                external_hash: projected_hash(env, &payload, &external_id),
                match_method: None,
                match_confidence: None,
            };
            match store.create_mapping(new, true).await {
                Ok(_) => {}
                Err(Error::AlreadyExists(detail)) => {
                    tracing::error!(
                        property = property_id,
                        local_id,
                        external_id = %external_id,
                        "Reservation was mapped concurrently after channel create"
                    );
                    return Err(Error::StaleWrite(detail));
                }
                Err(error) => return Err(error),
            }
            tracing::info!(
                property = property_id,
                local_id,
                external_id = %external_id,
                "Reservation created on channel"
            );
            Ok(Pushed {
                operation: SyncOperation::Create,
                external_id: Some(external_id),
                response: Some(response),
            })
        }
        Some(mapping) => {
            let (operation, logged) = if reservation.status == ReservationStatus::Cancelled {
                (
                    ChannelOperation::CancelReservation {
                        external_property_id,
                        external_id: mapping.external_id.clone(),
                    },
                    SyncOperation::Cancel,
                )
            } else {
                (
                    ChannelOperation::PushReservation {
                        external_property_id,
                        external_id: Some(mapping.external_id.clone()),
                        idempotency_key: None,
                    },
                    SyncOperation::Update,
                )
            };
            let response = env.channel.call(&operation, Some(payload.clone())).await?;
            store
                .compare_and_set_hashes(
                    &mapping.id,
                    mapping.local_hash.as_deref(),
                    &HashUpdate {
                        local_hash: Some(local_hash),
                        external_hash: projected_hash(env, &payload, &mapping.external_id),
                    },
                )
                .await?;
            Ok(Pushed {
                operation: logged,
                external_id: Some(mapping.external_id),
                response: Some(response),
            })
        }
    }
}

async fn retire_remote(
    env: &SyncEnv,
    external_property_id: &str,
    mapping: SyncMapping,
) -> Result<Pushed> {
    let operation = ChannelOperation::CancelReservation {
        external_property_id: external_property_id.to_string(),
        external_id: mapping.external_id.clone(),
    };
    let response = env.channel.call(&operation, None).await?;
    env.store.retire_mapping(&mapping.id).await?;
    tracing::info!(
        property = %mapping.property_id,
        local_id = %mapping.local_id,
        external_id = %mapping.external_id,
        "Deleted reservation cancelled on channel, mapping retired"
    );
    Ok(Pushed {
        operation: SyncOperation::Retire,
        external_id: Some(mapping.external_id),
        response: Some(response),
    })
}

/// Default ARI horizon starting today
pub fn default_window(env: &SyncEnv) -> DateRange {
    let start = Utc::now().date_naive();
    let end = start
        .checked_add_days(Days::new(u64::from(env.settings.ari_window_days)))
        .unwrap_or(start);
    DateRange { start, end }
}

async fn push_inventory(
    env: &SyncEnv,
    event: &ChangeEvent,
    kinds: &[InventoryKind],
    trace: &mut Trace,
) -> Result<Pushed> {
    let property_id = event.property_id.as_str();
    let Some(mapping) = env
        .store
        .find_mapping_by_local(property_id, EntityType::RoomType, &event.entity_id)
        .await?
    else {
        return Ok(Pushed::skipped(None, "room type is not mapped"));
    };
    trace.external_id = Some(mapping.external_id.clone());
    if !mapping.sync_direction.allows_outbound() {
        return Ok(Pushed::skipped(
            Some(mapping.external_id),
            "outbound sync disabled for this mapping",
        ));
    }

    let range = event.range.unwrap_or_else(|| default_window(env));
    let mut responses = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if !kind.enabled(&env.settings) {
            continue;
        }
        let (operation, payload) = inventory_request(env, &mapping, *kind, range).await?;
        trace.request = Some(payload.clone());
        responses.push(env.channel.call(&operation, Some(payload)).await?);
    }
    if responses.is_empty() {
        return Ok(Pushed::skipped(
            Some(mapping.external_id),
            "inventory push disabled",
        ));
    }
    Ok(Pushed {
        operation: SyncOperation::Push,
        external_id: Some(mapping.external_id),
        response: Some(Value::Array(responses)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ScriptedTransport;
    use crate::channel::HttpMethod;
    use crate::sync::testing::{fast_settings, local_reservation, TestHarness, PROPERTY};
    use pretty_assertions::assert_eq;

    fn event(entity: ChangeEntity, id: &str, operation: ChangeOperation) -> ChangeEvent {
        ChangeEvent {
            property_id: PROPERTY.to_string(),
            entity,
            entity_id: id.to_string(),
            operation,
            occurred_at: Utc::now(),
            range: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_push_creates_mapping_then_echo_is_skipped() {
        let transport = ScriptedTransport::new().with_fallback(201, json!({"id": "BK-77"}));
        let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-1", Origin::Pms));
        let created = event(ChangeEntity::Reservation, "r-1", ChangeOperation::Created);

        let log = push_change(&harness.env, &created, None, PushMode::IfChanged)
            .await
            .unwrap();
        assert_eq!(log.operation, SyncOperation::Create);
        assert_eq!(log.external_id.as_deref(), Some("BK-77"));
        assert!(log.success);

        let mapping = harness
            .store()
            .find_mapping_by_local(PROPERTY, EntityType::Reservation, "r-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.external_id, "BK-77");

        let again = push_change(&harness.env, &created, None, PushMode::IfChanged)
            .await
            .unwrap();
        assert_eq!(again.operation, SyncOperation::Noop);
        assert_eq!(harness.transport.request_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_repeated_after_mapping_failure_reuses_key() {
        let transport = ScriptedTransport::new().with_fallback(201, json!({"id": "BK-88"}));
        let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-5", Origin::Pms));
        let blocking = harness
            .store()
            .create_mapping(
                NewMapping {
                    property_id: PROPERTY.to_string(),
                    entity_type: EntityType::Reservation,
                    local_id: "r-old".to_string(),
                    external_id: "BK-88".to_string(),
                    external_property_id: "H-1".to_string(),
                    sync_direction: SyncDirection::Bidirectional,
                    local_hash: None,
                    external_hash: None,
                    match_method: None,
                    match_confidence: None,
                },
                true,
            )
            .await
            .unwrap();
        let created = event(ChangeEntity::Reservation, "r-5", ChangeOperation::Created);

        let failure = push_change(&harness.env, &created, None, PushMode::IfChanged)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::StaleWrite(_)));
        assert_eq!(failure.log.external_id.as_deref(), Some("BK-88"));

        harness.store().retire_mapping(&blocking.id).await.unwrap();
        let log = push_change(&harness.env, &created, None, PushMode::IfChanged)
            .await
            .unwrap();
        assert_eq!(log.operation, SyncOperation::Create);

        let sent = harness.transport.requests();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|request| request.method == HttpMethod::Post));
        assert_eq!(
            sent[0].idempotency_key.as_deref(),
            Some("innsync:p1:reservation:r-5")
        );
        assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_local_sends_cancel() {
        let harness = TestHarness::new().await.unwrap();
        let mut reservation = local_reservation("r-2", Origin::Pms);
        harness.pms.insert_reservation(reservation.clone());
        harness
            .store()
            .create_mapping(
                NewMapping {
                    property_id: PROPERTY.to_string(),
                    entity_type: EntityType::Reservation,
                    local_id: "r-2".to_string(),
                    external_id: "BK-2".to_string(),
                    external_property_id: "H-1".to_string(),
                    sync_direction: SyncDirection::Bidirectional,
                    local_hash: Some(local_reservation_hash(&reservation).unwrap()),
                    external_hash: None,
                    match_method: None,
                    match_confidence: None,
                },
                true,
            )
            .await
            .unwrap();
        reservation.status = ReservationStatus::Cancelled;
        harness.pms.insert_reservation(reservation);

        let log = push_change(
            &harness.env,
            &event(ChangeEntity::Reservation, "r-2", ChangeOperation::Cancelled),
            None,
            PushMode::IfChanged,
        )
        .await
        .unwrap();
        assert_eq!(log.operation, SyncOperation::Cancel);
        let sent = harness.transport.requests();
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].path, "/properties/H-1/reservations/BK-2/cancel");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unmapped_channel_booking_is_not_pushed() {
        let harness = TestHarness::new().await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-3", Origin::Channel));

        let log = push_change(
            &harness.env,
            &event(ChangeEntity::Reservation, "r-3", ChangeOperation::Updated),
            None,
            PushMode::IfChanged,
        )
        .await
        .unwrap();
        assert_eq!(log.operation, SyncOperation::Noop);
        assert_eq!(harness.transport.request_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_push_reports_failure() {
        let transport =
            ScriptedTransport::new().with_fallback(422, json!({"error": "arrival in the past"}));
        let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-4", Origin::Pms));

        let failure = push_change(
            &harness.env,
            &event(ChangeEntity::Reservation, "r-4", ChangeOperation::Created),
            None,
            PushMode::IfChanged,
        )
        .await
        .unwrap_err();
        assert!(!super::super::is_retryable(&failure.error));
        assert!(!failure.log.success);
        assert!(failure.log.request.is_some());
        assert_eq!(harness.transport.request_count(), 1);
    }
}
