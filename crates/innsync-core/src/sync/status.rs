//! Dashboard view of each (property, sync type) pair.

use serde::Serialize;

use super::SyncEnv;
use crate::models::{SyncState, SyncStatus, SyncType};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairStatus {
    pub property_id: String,
    pub sync_type: SyncType,
    /// Enabled by the direction flags
    pub enabled: bool,
    pub running: Option<SyncState>,
    pub last_run: Option<SyncState>,
    pub pending_retry: Option<SyncState>,
    pub needs_attention: bool,
}

/// Current state of every sync type for one property
pub async fn pair_status(env: &SyncEnv, property_id: &str) -> Result<Vec<PairStatus>> {
    env.external_property_id(property_id)?;
    let store = &env.store;
    let mut pairs = Vec::with_capacity(SyncType::ALL.len());
    for &sync_type in SyncType::ALL {
        pairs.push(PairStatus {
            property_id: property_id.to_string(),
            sync_type,
            enabled: env.settings.directions.allows(sync_type),
            running: store
                .latest_run_with_status(property_id, sync_type, SyncStatus::Running)
                .await?,
            last_run: store.latest_finished_run(property_id, sync_type).await?,
            pending_retry: store
                .latest_run_with_status(property_id, sync_type, SyncStatus::Pending)
                .await?,
            needs_attention: store.needs_attention(property_id, sync_type).await?,
        });
    }
    Ok(pairs)
}
