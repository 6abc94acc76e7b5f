//! Availability and rate (ARI) pushes.

use chrono::Utc;
use serde_json::Value;

use super::outbound::{default_window, push_change, PushMode};
use super::runner::RunProgress;
use super::state::RunLease;
use super::{ItemOutcome, SyncEnv};
use crate::channel::ChannelOperation;
use crate::config::SyncSettings;
use crate::db::MappingFilter;
use crate::models::{
    ChangeEntity, ChangeEvent, ChangeOperation, DateRange, EntityType, SyncMapping,
    SyncOperation,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryKind {
    Availability,
    Rates,
}

impl InventoryKind {
    pub const fn enabled(self, settings: &SyncSettings) -> bool {
        match self {
            Self::Availability => settings.directions.outbound_availability,
            Self::Rates => settings.directions.outbound_rates,
        }
    }

    const fn change_entity(self) -> ChangeEntity {
        match self {
            Self::Availability => ChangeEntity::Availability,
            Self::Rates => ChangeEntity::Rate,
        }
    }
}

/// Channel operation and payload for one room type's inventory over `range`
pub(super) async fn inventory_request(
    env: &SyncEnv,
    mapping: &SyncMapping,
    kind: InventoryKind,
    range: DateRange,
) -> Result<(ChannelOperation, Value)> {
    let external_property_id = env.external_property_id(&mapping.property_id)?;
    Ok(match kind {
        InventoryKind::Availability => {
            let days = env
                .pms
                .availability(&mapping.property_id, &mapping.local_id, range)
                .await?;
            (
                ChannelOperation::PushAvailability {
                    external_property_id,
                },
                env.mapper
                    .availability_to_external(&mapping.external_id, &days),
            )
        }
        InventoryKind::Rates => {
            let days = env
                .pms
                .rates(&mapping.property_id, &mapping.local_id, range)
                .await?;
            (
                ChannelOperation::PushRates {
                    external_property_id,
                },
                env.mapper.rates_to_external(&mapping.external_id, &days),
            )
        }
    })
}

/// Bulk run body: push the default window for every mapped room type
pub(super) async fn push_inventory_run(
    env: &SyncEnv,
    lease: &RunLease,
    progress: &mut RunProgress,
    kind: InventoryKind,
) -> Result<()> {
    let property_id = lease.run.property_id.as_str();
    let mappings = env
        .store
        .list_mappings(&MappingFilter {
            property_id: Some(property_id.to_string()),
            entity_type: Some(EntityType::RoomType),
            include_retired: false,
            limit: 10_000,
            offset: 0,
        })
        .await?;
    unmapped_room_types(env, property_id, &mappings).await;
    let range = default_window(env);

    for mapping in mappings {
        let event = ChangeEvent {
            property_id: property_id.to_string(),
            entity: kind.change_entity(),
            entity_id: mapping.local_id.clone(),
            operation: ChangeOperation::Updated,
            occurred_at: Utc::now(),
            range: Some(range),
        };
        match push_change(env, &event, Some(lease.run.id), PushMode::Always).await {
            Ok(log) => {
                env.store.append_log(&log).await?;
                let outcome = if log.operation == SyncOperation::Noop {
                    ItemOutcome::Unchanged
                } else {
                    ItemOutcome::Updated
                };
                outcome.tally(&mut progress.stats);
            }
            Err(failure) => {
                env.store.append_log(&failure.log).await?;
                if !failure.error.is_item_scoped() {
                    return Err(failure.error);
                }
                tracing::warn!(
                    property = property_id,
                    room_type = %mapping.local_id,
                    error = %failure.error,
                    "Inventory push failed for room type"
                );
                ItemOutcome::Failed.tally(&mut progress.stats);
            }
        }
        env.state
            .heartbeat(lease, progress.cursor.as_deref(), &progress.stats)
            .await?;
    }
    Ok(())
}

/// PMS room types no active mapping covers; they never reach the channel
async fn unmapped_room_types(
    env: &SyncEnv,
    property_id: &str,
    mappings: &[SyncMapping],
) -> Vec<String> {
    let room_types = match env.pms.list_room_types(property_id).await {
        Ok(room_types) => room_types,
        Err(error) => {
            tracing::debug!(
                property = property_id,
                error = %error,
                "Room type listing unavailable"
            );
            return Vec::new();
        }
    };
    let unmapped: Vec<String> = room_types
        .into_iter()
        .map(|room_type| room_type.id)
        .filter(|id| !mappings.iter().any(|mapping| &mapping.local_id == id))
        .collect();
    if !unmapped.is_empty() {
        tracing::warn!(
            property = property_id,
            room_types = ?unmapped,
            "Room types without a channel mapping are not pushed"
        );
    }
    unmapped
}
