//! Apply one inbound channel record to the PMS.
//!
//! Each call writes exactly one sync log row. Per-item problems (bad data,
//! PMS rejection, a lost compare-and-set after retries) become a failed
//! outcome; storage failures propagate and abort the caller's run.

use std::time::Instant;

use serde_json::{json, Value};

use super::locks::{entity_key, Side};
use super::{ItemOutcome, SyncEnv};
use crate::conflict::{detect_reservation_conflicts, plan, Detection, Plan};
use crate::db::HashUpdate;
use crate::mapper::{local_guest_hash, local_reservation_hash, ExternalReservation};
use crate::matching::{resolve_guest, GuestMatch, MatchScope};
use crate::models::{
    Direction, EntityType, NewConflict, NewMapping, Reservation, ReservationStatus,
    ResolutionAction, RunId, SyncDirection, SyncLog, SyncMapping, SyncOperation,
};
use crate::util::compact_text;
use crate::{Error, Result};

/// Attempts per item when a concurrent writer wins the mapping compare-and-set
const STALE_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Pull and webhook path: divergence is detected and may hold the item
    Detect,
    /// An operator accepted the remote side; detection is skipped
    Force,
}

struct Applied {
    outcome: ItemOutcome,
    operation: SyncOperation,
    local_id: Option<String>,
    response: Option<Value>,
}

impl Applied {
    const fn new(outcome: ItemOutcome, operation: SyncOperation, local_id: Option<String>) -> Self {
        Self {
            outcome,
            operation,
            local_id,
            response: None,
        }
    }

    fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    const fn conflict(&self) -> bool {
        matches!(
            self.outcome,
            ItemOutcome::AutoResolved | ItemOutcome::KeptLocal | ItemOutcome::Held
        )
    }
}

fn raw_external_id(raw: &Value) -> Option<String> {
    raw.get("id").and_then(|id| match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Apply one raw reservation record from the channel.
pub async fn apply_reservation(
    env: &SyncEnv,
    property_id: &str,
    run_id: Option<RunId>,
    raw: &Value,
    mode: ApplyMode,
) -> Result<ItemOutcome> {
    let started = Instant::now();
    let draft = SyncLog::new(
        property_id,
        Direction::Inbound,
        EntityType::Reservation,
        SyncOperation::Update,
    )
    .in_run(run_id)
    .with_request(raw.clone());

    let remote = match env.mapper.reservation_from_external(raw) {
        Ok(remote) => remote,
        Err(error) => {
            tracing::warn!(
                property = property_id,
                error = %error,
                "Skipping malformed inbound reservation"
            );
            let log = draft
                .with_external_id(raw_external_id(raw))
                .failed(error.to_string(), started.elapsed());
            env.store.append_log(&log).await?;
            return Ok(ItemOutcome::Failed);
        }
    };
    let draft = draft.with_external_id(Some(remote.external_id.clone()));

    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        match apply_once(env, property_id, &remote, raw, mode).await {
            Err(Error::StaleWrite(detail)) if attempt < STALE_WRITE_ATTEMPTS => {
                tracing::debug!(
                    property = property_id,
                    external_id = %remote.external_id,
                    attempt,
                    detail = %detail,
                    "Concurrent write on reservation, retrying"
                );
            }
            other => break other,
        }
    };

    match result {
        Ok(applied) => {
            let mut log = draft
                .with_operation(applied.operation)
                .with_local_id(applied.local_id.clone());
            if let Some(response) = applied.response.clone() {
                log = log.with_response(response);
            }
            if applied.conflict() {
                log = log.flag_conflict();
            }
            env.store
                .append_log(&log.succeeded(started.elapsed()))
                .await?;
            Ok(applied.outcome)
        }
        Err(error) if error.is_item_scoped() => {
            tracing::warn!(
                property = property_id,
                external_id = %remote.external_id,
                error = %error,
                "Inbound reservation failed"
            );
            let log = draft.failed(compact_text(&error.to_string()), started.elapsed());
            env.store.append_log(&log).await?;
            Ok(ItemOutcome::Failed)
        }
        Err(error) => {
            let log = draft.failed(compact_text(&error.to_string()), started.elapsed());
            if let Err(log_error) = env.store.append_log(&log).await {
                tracing::warn!(error = %log_error, "Could not record failed inbound item");
            }
            Err(error)
        }
    }
}

async fn apply_once(
    env: &SyncEnv,
    property_id: &str,
    remote: &ExternalReservation,
    raw: &Value,
    mode: ApplyMode,
) -> Result<Applied> {
    let store = &env.store;
    let external_id = remote.external_id.as_str();

    let seen = store
        .find_mapping_by_external(property_id, EntityType::Reservation, external_id)
        .await?;
    let mut keys = vec![entity_key(
        property_id,
        EntityType::Reservation,
        Side::External,
        external_id,
    )];
    if let Some(mapping) = &seen {
        keys.push(entity_key(
            property_id,
            EntityType::Reservation,
            Side::Local,
            &mapping.local_id,
        ));
    }
    let _guard = env.locks.lock(keys).await?;

    let mapping = store
        .find_mapping_by_external(property_id, EntityType::Reservation, external_id)
        .await?;
    if mapping.as_ref().map(|m| &m.id) != seen.as_ref().map(|m| &m.id) {
        return Err(Error::StaleWrite(format!(
            "mapping for reservation {external_id} changed while waiting"
        )));
    }

    let local_id = mapping.as_ref().map(|m| m.local_id.clone());
    if let Some(mapping) = &mapping {
        if !mapping.sync_direction.allows_inbound() {
            return Ok(Applied::new(ItemOutcome::Unchanged, SyncOperation::Noop, local_id)
                .with_response(json!({"skipped": "inbound sync disabled for this mapping"})));
        }
    }

    let remote_hash = remote.fingerprint()?;

    if mode == ApplyMode::Detect {
        let open = store
            .open_conflicts_for_entity(property_id, EntityType::Reservation, external_id)
            .await?;
        if !open.is_empty() {
            let local = match &mapping {
                Some(mapping) => env.pms.get_reservation(property_id, &mapping.local_id).await?,
                None => None,
            };
            let local_snapshot = serde_json::to_value(&local)?;
            for conflict in &open {
                store
                    .refresh_open_conflict(
                        &conflict.id,
                        &local_snapshot,
                        raw,
                        conflict.detail.as_deref(),
                    )
                    .await?;
            }
            let ids: Vec<String> = open.iter().map(|c| c.id.to_string()).collect();
            tracing::info!(
                property = property_id,
                external_id,
                open = ids.len(),
                "Reservation held by open conflict, snapshot refreshed"
            );
            return Ok(Applied::new(ItemOutcome::Held, SyncOperation::Noop, local_id)
                .with_response(json!({"open_conflicts": ids})));
        }

        if mapping
            .as_ref()
            .is_some_and(|m| m.external_hash.as_deref() == Some(remote_hash.as_str()))
        {
            return Ok(Applied::new(ItemOutcome::Unchanged, SyncOperation::Noop, local_id));
        }
    }

    let local = match &mapping {
        Some(mapping) => env.pms.get_reservation(property_id, &mapping.local_id).await?,
        None => None,
    };
    if let (Some(mapping), None) = (&mapping, &local) {
        tracing::warn!(
            property = property_id,
            external_id,
            local_id = %mapping.local_id,
            "Mapped reservation no longer exists locally, retiring mapping"
        );
        store.retire_mapping(&mapping.id).await?;
        return Err(Error::StaleWrite(format!(
            "local side of reservation {external_id} vanished"
        )));
    }

    let external_property_id = env.external_property_id(property_id)?;
    let guest = match &remote.customer {
        Some(customer) => Some(
            resolve_guest(
                store,
                env.pms.as_ref(),
                MatchScope {
                    property_id,
                    external_property_id: &external_property_id,
                },
                customer,
            )
            .await?,
        ),
        None => None,
    };
    let room_type_id = match &remote.room_type_external_id {
        Some(room_type) => store
            .find_mapping_by_external(property_id, EntityType::RoomType, room_type)
            .await?
            .map(|m| m.local_id),
        None => None,
    };
    let guest_id = guest.as_ref().map(|g| g.guest.id.clone());

    let applied = match (mapping, local) {
        (Some(mapping), Some(local)) => {
            let target = Target {
                mapping: &mapping,
                local: &local,
                remote,
                raw,
                remote_hash,
            };
            update_existing(env, property_id, target, guest_id, room_type_id, mode).await?
        }
        _ => {
            create_new(
                env,
                property_id,
                &external_property_id,
                remote,
                remote_hash,
                guest_id,
                room_type_id,
            )
            .await?
        }
    };

    Ok(match guest {
        Some(guest) => attach_match(applied, &guest),
        None => applied,
    })
}

fn attach_match(mut applied: Applied, guest: &GuestMatch) -> Applied {
    let matched = json!({
        "guest_id": guest.guest.id,
        "method": guest.method,
        "confidence": guest.confidence,
        "flagged": guest.flagged,
    });
    let mut response = applied.response.take().unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut response {
        map.insert("guest_match".to_string(), matched);
    }
    applied.with_response(response)
}

struct Target<'a> {
    mapping: &'a SyncMapping,
    local: &'a Reservation,
    remote: &'a ExternalReservation,
    raw: &'a Value,
    remote_hash: String,
}

async fn update_existing(
    env: &SyncEnv,
    property_id: &str,
    target: Target<'_>,
    guest_id: Option<String>,
    room_type_id: Option<String>,
    mode: ApplyMode,
) -> Result<Applied> {
    let Target {
        mapping,
        local,
        remote,
        raw,
        remote_hash,
    } = target;
    let store = &env.store;
    let local_id = Some(local.id.clone());

    let (decision, detections) = match mode {
        ApplyMode::Force => (Plan::ApplyRemote, Vec::new()),
        ApplyMode::Detect => {
            let current_hash = local_reservation_hash(local)?;
            let dirty = mapping.local_hash.as_deref() != Some(current_hash.as_str());
            let policy = env.conflict_policy(property_id).await?;
            let detections = detect_reservation_conflicts(local, remote, dirty, &policy);
            (plan(&detections, local.origin, &policy), detections)
        }
    };

    match decision {
        Plan::Hold => {
            let ids = record_conflicts(env, mapping, local, raw, &detections, None).await?;
            tracing::warn!(
                property = property_id,
                external_id = %mapping.external_id,
                conflicts = ids.len(),
                "Reservation conflict queued for review"
            );
            Ok(Applied::new(ItemOutcome::Held, SyncOperation::Noop, local_id)
                .with_response(json!({"conflicts": ids, "plan": decision})))
        }
        Plan::KeepLocal => {
            let ids = record_conflicts(
                env,
                mapping,
                local,
                raw,
                &detections,
                Some(ResolutionAction::AcceptLocal),
            )
            .await?;
            // Keep the old local hash so the next outbound event still pushes.
            store
                .compare_and_set_hashes(
                    &mapping.id,
                    mapping.local_hash.as_deref(),
                    &HashUpdate {
                        local_hash: mapping.local_hash.clone(),
                        external_hash: Some(remote_hash),
                    },
                )
                .await?;
            tracing::info!(
                property = property_id,
                external_id = %mapping.external_id,
                "Conflict resolved by policy, local kept"
            );
            Ok(Applied::new(ItemOutcome::KeptLocal, SyncOperation::Noop, local_id)
                .with_response(json!({"conflicts": ids, "plan": decision})))
        }
        Plan::Apply | Plan::ApplyRemote => {
            let input = remote.to_input(guest_id, room_type_id, Some(local));
            let updated = env
                .pms
                .update_reservation(property_id, &local.id, &input)
                .await?;
            store
                .compare_and_set_hashes(
                    &mapping.id,
                    mapping.local_hash.as_deref(),
                    &HashUpdate {
                        local_hash: Some(local_reservation_hash(&updated)?),
                        external_hash: Some(remote_hash),
                    },
                )
                .await?;

            let operation = if updated.status == ReservationStatus::Cancelled
                && local.status != ReservationStatus::Cancelled
            {
                SyncOperation::Cancel
            } else {
                SyncOperation::Update
            };

            if decision == Plan::ApplyRemote && !detections.is_empty() {
                let ids = record_conflicts(
                    env,
                    mapping,
                    local,
                    raw,
                    &detections,
                    Some(ResolutionAction::AcceptRemote),
                )
                .await?;
                tracing::info!(
                    property = property_id,
                    external_id = %mapping.external_id,
                    "Conflict resolved by policy, remote applied"
                );
                return Ok(Applied::new(ItemOutcome::AutoResolved, operation, local_id)
                    .with_response(json!({"conflicts": ids, "plan": decision})));
            }
            Ok(Applied::new(ItemOutcome::Updated, operation, local_id))
        }
    }
}

async fn record_conflicts(
    env: &SyncEnv,
    mapping: &SyncMapping,
    local: &Reservation,
    raw: &Value,
    detections: &[Detection],
    auto: Option<ResolutionAction>,
) -> Result<Vec<String>> {
    let local_snapshot = serde_json::to_value(local)?;
    let mut ids = Vec::with_capacity(detections.len());
    for detection in detections {
        let detected = NewConflict {
            property_id: mapping.property_id.clone(),
            entity_type: EntityType::Reservation,
            local_id: Some(local.id.clone()),
            external_id: mapping.external_id.clone(),
            mapping_id: Some(mapping.id),
            conflict_type: detection.conflict_type,
            origin: local.origin,
            local_snapshot: local_snapshot.clone(),
            remote_snapshot: raw.clone(),
            detail: Some(detection.detail.clone()),
        };
        let conflict = match auto {
            Some(action) => detected.into_auto(action),
            None => detected.into_manual(),
        };
        env.store.insert_conflict(&conflict).await?;
        ids.push(conflict.id.to_string());
    }
    Ok(ids)
}

async fn create_new(
    env: &SyncEnv,
    property_id: &str,
    external_property_id: &str,
    remote: &ExternalReservation,
    remote_hash: String,
    guest_id: Option<String>,
    room_type_id: Option<String>,
) -> Result<Applied> {
    let input = remote.to_input(guest_id, room_type_id, None);
    let created = env.pms.create_reservation(property_id, &input).await?;

    let new = NewMapping {
        property_id: property_id.to_string(),
        entity_type: EntityType::Reservation,
        local_id: created.id.clone(),
        external_id: remote.external_id.clone(),
        external_property_id: external_property_id.to_string(),
        sync_direction: SyncDirection::Bidirectional,
        local_hash: Some(local_reservation_hash(&created)?),
        external_hash: Some(remote_hash),
        match_method: None,
        match_confidence: None,
    };
    match env.store.create_mapping(new, true).await {
        Ok(_) => {
            tracing::info!(
                property = property_id,
                external_id = %remote.external_id,
                local_id = %created.id,
                "Created local reservation from channel"
            );
            Ok(Applied::new(
                ItemOutcome::Created,
                SyncOperation::Create,
                Some(created.id),
            ))
        }
        Err(Error::AlreadyExists(detail)) => {
            tracing::warn!(
                property = property_id,
                external_id = %remote.external_id,
                orphan = %created.id,
                "Reservation mapped concurrently, local copy left unmapped"
            );
            Err(Error::StaleWrite(detail))
        }
        Err(error) => Err(error),
    }
}

/// Apply one raw customer record from the channel.
pub async fn apply_guest(
    env: &SyncEnv,
    property_id: &str,
    run_id: Option<RunId>,
    raw: &Value,
) -> Result<ItemOutcome> {
    let started = Instant::now();
    let draft = SyncLog::new(
        property_id,
        Direction::Inbound,
        EntityType::Guest,
        SyncOperation::Update,
    )
    .in_run(run_id)
    .with_request(raw.clone())
    .with_external_id(raw_external_id(raw));

    let result = apply_guest_once(env, property_id, raw).await;
    match result {
        Ok(applied) => {
            let mut log = draft
                .with_operation(applied.operation)
                .with_local_id(applied.local_id.clone());
            if let Some(response) = applied.response {
                log = log.with_response(response);
            }
            env.store.append_log(&log.succeeded(started.elapsed())).await?;
            Ok(applied.outcome)
        }
        Err(error) if error.is_item_scoped() => {
            tracing::warn!(property = property_id, error = %error, "Inbound customer failed");
            let log = draft.failed(compact_text(&error.to_string()), started.elapsed());
            env.store.append_log(&log).await?;
            Ok(ItemOutcome::Failed)
        }
        Err(error) => {
            let log = draft.failed(compact_text(&error.to_string()), started.elapsed());
            if let Err(log_error) = env.store.append_log(&log).await {
                tracing::warn!(error = %log_error, "Could not record failed inbound item");
            }
            Err(error)
        }
    }
}

async fn apply_guest_once(env: &SyncEnv, property_id: &str, raw: &Value) -> Result<Applied> {
    let external = env.mapper.guest_from_external(raw)?;
    let external_id = external
        .external_id
        .clone()
        .ok_or_else(|| Error::Validation("customer record has no id".to_string()))?;
    let external_property_id = env.external_property_id(property_id)?;

    let _guard = env
        .locks
        .lock(vec![entity_key(
            property_id,
            EntityType::Guest,
            Side::External,
            &external_id,
        )])
        .await?;

    let store = &env.store;
    let fingerprint = external.fingerprint()?;
    let mapping = store
        .find_mapping_by_external(property_id, EntityType::Guest, &external_id)
        .await?;

    if let Some(mapping) = mapping {
        let local_id = Some(mapping.local_id.clone());
        if mapping.external_hash.as_deref() == Some(fingerprint.as_str()) {
            return Ok(Applied::new(ItemOutcome::Unchanged, SyncOperation::Noop, local_id));
        }
        if !mapping.sync_direction.allows_inbound() {
            return Ok(Applied::new(ItemOutcome::Unchanged, SyncOperation::Noop, local_id)
                .with_response(json!({"skipped": "inbound sync disabled for this mapping"})));
        }
        if let Some(guest) = env.pms.get_guest(property_id, &mapping.local_id).await? {
            let current = local_guest_hash(&guest)?;
            if mapping.local_hash.as_deref() != Some(current.as_str()) {
                // Local edits since the last sync win for guest profiles.
                store
                    .compare_and_set_hashes(
                        &mapping.id,
                        mapping.local_hash.as_deref(),
                        &HashUpdate {
                            local_hash: mapping.local_hash.clone(),
                            external_hash: Some(fingerprint),
                        },
                    )
                    .await?;
                return Ok(Applied::new(ItemOutcome::KeptLocal, SyncOperation::Noop, local_id)
                    .with_response(json!({"skipped": "local guest changed since last sync"})));
            }

            let updated = env
                .pms
                .update_guest(property_id, &guest.id, &external.to_input())
                .await?;
            store
                .compare_and_set_hashes(
                    &mapping.id,
                    mapping.local_hash.as_deref(),
                    &HashUpdate {
                        local_hash: Some(local_guest_hash(&updated)?),
                        external_hash: Some(fingerprint),
                    },
                )
                .await?;
            return Ok(Applied::new(ItemOutcome::Updated, SyncOperation::Update, local_id));
        }
        // resolve_guest retires the dangling mapping and matches afresh
    }

    let matched = resolve_guest(
        store,
        env.pms.as_ref(),
        MatchScope {
            property_id,
            external_property_id: &external_property_id,
        },
        &external,
    )
    .await?;
    let (outcome, operation) = if matched.created() {
        (ItemOutcome::Created, SyncOperation::Create)
    } else {
        (ItemOutcome::Updated, SyncOperation::Noop)
    };
    Ok(
        attach_match(
            Applied::new(outcome, operation, Some(matched.guest.id.clone())),
            &matched,
        ),
    )
}
