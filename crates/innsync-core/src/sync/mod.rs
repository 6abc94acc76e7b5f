//! Sync services: run state, inbound apply, outbound pushes, webhooks and
//! the scheduler. Every service receives its collaborators through an
//! explicit [`SyncEnv`].

mod apply;
mod ari;
mod inbound;
mod locks;
mod outbound;
mod queue;
mod resolution;
mod runner;
mod scheduler;
mod state;
mod status;
pub mod testing;
mod webhook;

use std::sync::Arc;

use crate::channel::ChannelClient;
use crate::config::{ConflictPolicy, PropertyDirectory, SyncSettings};
use crate::mapper::ChannelMapper;
use crate::models::SyncStats;
use crate::pms::PmsGateway;
use crate::services::SyncStore;
use crate::{Error, Result};

pub use apply::{apply_guest, apply_reservation, ApplyMode};
pub use ari::InventoryKind;
pub use locks::{entity_key, EntityGuard, EntityLocks, Side};
pub use outbound::{default_window, push_change, PushFailure, PushMode};
pub use queue::{process_job, shard_for, JobOutcome, OutboundJob, OutboundQueue};
pub use resolution::{resolve_conflict, MergeField, ResolutionReport, ResolutionRequest};
pub use runner::{execute_run, run_manual, run_scheduled, start_manual, RunReport};
pub use scheduler::Scheduler;
pub use state::{Acquired, FailureDisposition, RunLease, SyncStateManager};
pub use status::{pair_status, PairStatus};
pub use webhook::{
    process_webhook_event, sign_payload, spawn_webhook_processor, sweep_unprocessed,
    verify_signature, WebhookAck, WebhookError, WebhookIntake, WebhookOutcome,
    MAX_WEBHOOK_ATTEMPTS, SIGNATURE_TOLERANCE_SECS, WEBHOOK_CLAIM_SECS,
};

/// Collaborators shared by every sync invocation
#[derive(Clone)]
pub struct SyncEnv {
    pub store: SyncStore,
    pub pms: Arc<dyn PmsGateway>,
    pub channel: Arc<ChannelClient>,
    pub mapper: Arc<dyn ChannelMapper>,
    pub settings: Arc<SyncSettings>,
    pub properties: Arc<PropertyDirectory>,
    pub state: SyncStateManager,
    pub locks: EntityLocks,
}

impl SyncEnv {
    pub fn new(
        store: SyncStore,
        pms: Arc<dyn PmsGateway>,
        channel: Arc<ChannelClient>,
        mapper: Arc<dyn ChannelMapper>,
        settings: SyncSettings,
        properties: PropertyDirectory,
    ) -> Self {
        let state = SyncStateManager::new(store.clone(), &settings);
        let locks = EntityLocks::new(settings.request_timeout * 4);
        Self {
            store,
            pms,
            channel,
            mapper,
            settings: Arc::new(settings),
            properties: Arc::new(properties),
            state,
            locks,
        }
    }

    /// Channel-side id of a configured property
    pub fn external_property_id(&self, property_id: &str) -> Result<String> {
        self.properties
            .external_id(property_id)
            .map(ToString::to_string)
            .ok_or_else(|| Error::NotFound(format!("property `{property_id}` is not configured")))
    }

    /// Conflict policy with this property's stored overrides applied
    pub async fn conflict_policy(&self, property_id: &str) -> Result<ConflictPolicy> {
        let overrides = self.store.property_settings(property_id).await?;
        Ok(self.settings.for_property(overrides.as_ref()))
    }
}

/// Result of handling one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
    Unchanged,
    /// Applied after policy resolved a conflict in favour of the remote side
    AutoResolved,
    /// Policy kept the local side; remote data was not applied
    KeptLocal,
    /// Waiting on an operator; the local entity was left untouched
    Held,
    Failed,
}

impl ItemOutcome {
    pub fn tally(self, stats: &mut SyncStats) {
        stats.processed += 1;
        match self {
            Self::Created => stats.created += 1,
            Self::Updated => stats.updated += 1,
            Self::Unchanged => stats.unchanged += 1,
            Self::AutoResolved => {
                stats.updated += 1;
                stats.conflicts += 1;
            }
            Self::KeptLocal | Self::Held => stats.conflicts += 1,
            Self::Failed => stats.failed += 1,
        }
    }
}

/// Whether an outbound job that failed with `error` may succeed on redelivery
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Channel(channel) => channel.is_transient(),
        Error::StaleWrite(_)
        | Error::LockUnavailable(_)
        | Error::Pms(_)
        | Error::Database(_)
        | Error::LibSql(_)
        | Error::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;

    #[test]
    fn tally_counts_conflicts_separately() {
        let mut stats = SyncStats::default();
        for outcome in [
            ItemOutcome::Created,
            ItemOutcome::AutoResolved,
            ItemOutcome::Held,
            ItemOutcome::Failed,
            ItemOutcome::Unchanged,
        ] {
            outcome.tally(&mut stats);
        }
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.conflicts, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn retryable_errors() {
        assert!(is_retryable(&Error::Channel(ChannelError::CircuitOpen)));
        assert!(is_retryable(&Error::StaleWrite("m".into())));
        assert!(!is_retryable(&Error::Channel(ChannelError::Client {
            status: 422,
            message: String::new()
        })));
        assert!(!is_retryable(&Error::Validation("bad".into())));
    }
}
