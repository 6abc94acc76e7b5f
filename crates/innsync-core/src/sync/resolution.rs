//! Operator resolution of queued conflicts.
//!
//! Every action closes all open conflicts of the entity and then runs a
//! one-shot sync in the winning direction: accept-remote applies the remote
//! snapshot, accept-local and merge push the local record.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::apply::{apply_reservation, ApplyMode};
use super::locks::{entity_key, Side};
use super::outbound::{push_change, PushMode};
use super::{ItemOutcome, SyncEnv};
use crate::mapper::ExternalReservation;
use crate::models::{
    ChangeEntity, ChangeEvent, ChangeOperation, Conflict, ConflictId, EntityType,
    ReservationInput, ResolutionAction, SyncOperation,
};
use crate::{Error, Result};

db_enum! {
    /// Reservation field groups a merge can take from the remote side
    MergeField {
        Status => "status",
        Dates => "dates",
        Occupancy => "occupancy",
        Amount => "amount",
        Notes => "notes",
    }
}

impl MergeField {
    fn take(self, remote: &ExternalReservation, input: &mut ReservationInput) {
        match self {
            Self::Status => input.status = remote.status,
            Self::Dates => {
                input.check_in = remote.check_in;
                input.check_out = remote.check_out;
            }
            Self::Occupancy => {
                input.adults = remote.adults;
                input.children = remote.children;
            }
            Self::Amount => {
                input.total_amount_cents = remote.total_amount_cents;
                input.currency.clone_from(&remote.currency);
            }
            Self::Notes => input.notes.clone_from(&remote.notes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub action: ResolutionAction,
    pub resolved_by: String,
    /// Fields taken from the remote snapshot; only read for merges
    #[serde(default)]
    pub take_remote: Vec<MergeField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub conflict_id: ConflictId,
    pub action: ResolutionAction,
    /// Open conflicts closed for the entity, including this one
    pub closed: u64,
    /// Set when the remote side was applied locally
    pub inbound: Option<ItemOutcome>,
    /// Set when the local side was pushed
    pub outbound: Option<SyncOperation>,
}

fn local_id(conflict: &Conflict) -> Result<&str> {
    conflict.local_id.as_deref().ok_or_else(|| {
        Error::InvalidInput(format!(
            "conflict {} has no local record to keep",
            conflict.id
        ))
    })
}

async fn push_local(env: &SyncEnv, conflict: &Conflict) -> Result<SyncOperation> {
    let event = ChangeEvent {
        property_id: conflict.property_id.clone(),
        entity: ChangeEntity::Reservation,
        entity_id: local_id(conflict)?.to_string(),
        operation: ChangeOperation::Updated,
        occurred_at: Utc::now(),
        range: None,
    };
    match push_change(env, &event, None, PushMode::Always).await {
        Ok(log) => {
            env.store.append_log(&log).await?;
            Ok(log.operation)
        }
        Err(failure) => {
            env.store.append_log(&failure.log).await?;
            Err(failure.error)
        }
    }
}

async fn merge_into_local(env: &SyncEnv, conflict: &Conflict, fields: &[MergeField]) -> Result<()> {
    let local_id = local_id(conflict)?;
    let remote = env
        .mapper
        .reservation_from_external(&conflict.remote_snapshot)?;
    let _guard = env
        .locks
        .lock(vec![
            entity_key(
                &conflict.property_id,
                EntityType::Reservation,
                Side::External,
                &conflict.external_id,
            ),
            entity_key(
                &conflict.property_id,
                EntityType::Reservation,
                Side::Local,
                local_id,
            ),
        ])
        .await?;
    let local = env
        .pms
        .get_reservation(&conflict.property_id, local_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("reservation {local_id}")))?;

    let mut input = local.to_input();
    for field in fields {
        field.take(&remote, &mut input);
    }
    env.pms
        .update_reservation(&conflict.property_id, local_id, &input)
        .await?;
    Ok(())
}

/// Close an open conflict with an operator decision.
pub async fn resolve_conflict(
    env: &SyncEnv,
    id: &ConflictId,
    request: &ResolutionRequest,
) -> Result<ResolutionReport> {
    let resolved_by = request.resolved_by.trim();
    if resolved_by.is_empty() {
        return Err(Error::InvalidInput("resolved_by is required".to_string()));
    }
    let conflict = env
        .store
        .get_conflict(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
    if !conflict.is_open() {
        return Err(Error::InvalidInput(format!(
            "conflict {id} is already {}",
            conflict.resolution_strategy
        )));
    }
    if conflict.entity_type != EntityType::Reservation {
        return Err(Error::InvalidInput(format!(
            "conflicts on {} records cannot be resolved here",
            conflict.entity_type
        )));
    }

    let mut report = ResolutionReport {
        conflict_id: conflict.id,
        action: request.action,
        closed: 0,
        inbound: None,
        outbound: None,
    };
    match request.action {
        ResolutionAction::AcceptRemote => {
            let outcome = apply_reservation(
                env,
                &conflict.property_id,
                None,
                &conflict.remote_snapshot,
                ApplyMode::Force,
            )
            .await?;
            if outcome == ItemOutcome::Failed {
                return Err(Error::Validation(
                    "remote snapshot could not be applied, see sync log".to_string(),
                ));
            }
            report.inbound = Some(outcome);
        }
        ResolutionAction::AcceptLocal => {
            report.outbound = Some(push_local(env, &conflict).await?);
        }
        ResolutionAction::Merge => {
            if request.take_remote.is_empty() {
                return Err(Error::InvalidInput(
                    "merge needs at least one field to take from the remote side".to_string(),
                ));
            }
            merge_into_local(env, &conflict, &request.take_remote).await?;
            report.outbound = Some(push_local(env, &conflict).await?);
        }
    }

    report.closed = env
        .store
        .resolve_entity_conflicts(
            &conflict.property_id,
            conflict.entity_type,
            &conflict.external_id,
            request.action,
            resolved_by,
            Utc::now(),
        )
        .await?;
    tracing::info!(
        property = %conflict.property_id,
        conflict = %conflict.id,
        action = %request.action,
        resolved_by,
        closed = report.closed,
        "Conflict resolved"
    );
    Ok(report)
}
