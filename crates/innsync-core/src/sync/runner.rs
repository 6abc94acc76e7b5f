//! Drive one run from lease to terminal state.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use super::ari::{push_inventory_run, InventoryKind};
use super::inbound::pull;
use super::state::{Acquired, FailureDisposition, RunLease};
use super::SyncEnv;
use crate::models::{RunId, SyncStats, SyncStatus, SyncType};
use crate::util::compact_text;
use crate::{Error, Result};

/// Mutable run progress, checkpointed through heartbeats
#[derive(Debug, Clone, Default)]
pub(crate) struct RunProgress {
    pub cursor: Option<String>,
    pub stats: SyncStats,
}

impl RunProgress {
    /// A retry resumes its own cursor; a fresh pull continues from the last
    /// completed run.
    async fn starting(env: &SyncEnv, lease: &RunLease) -> Result<Self> {
        let run = &lease.run;
        let cursor = match &run.cursor {
            Some(cursor) => Some(cursor.clone()),
            None if run.sync_type.is_pull() => env
                .store
                .latest_run_with_status(&run.property_id, run.sync_type, SyncStatus::Completed)
                .await?
                .and_then(|last| last.cursor),
            None => None,
        };
        Ok(Self {
            cursor,
            stats: SyncStats::default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub property_id: String,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub stats: SyncStats,
    pub cursor: Option<String>,
    pub error: Option<String>,
    pub disposition: Option<FailureDisposition>,
}

/// Scheduler entry point. `None` when the pair was skipped.
pub async fn run_scheduled(
    env: &SyncEnv,
    property_id: &str,
    sync_type: SyncType,
) -> Result<Option<RunReport>> {
    if !env.settings.directions.allows(sync_type) {
        return Ok(None);
    }
    env.external_property_id(property_id)?;
    match env
        .state
        .acquire_scheduled(property_id, sync_type, Utc::now())
        .await?
    {
        Acquired::Lease(lease) => execute_run(env, lease).await.map(Some),
        skipped => {
            tracing::debug!(
                property = property_id,
                sync_type = sync_type.as_str(),
                skipped = ?skipped,
                "Scheduled sync skipped"
            );
            Ok(None)
        }
    }
}

/// Take the lease for an operator-triggered run. `None` when one is in flight.
pub async fn start_manual(
    env: &SyncEnv,
    property_id: &str,
    sync_type: SyncType,
) -> Result<Option<RunLease>> {
    if !env.settings.directions.allows(sync_type) {
        return Err(Error::InvalidInput(format!(
            "{sync_type} sync is disabled by configuration"
        )));
    }
    env.external_property_id(property_id)?;
    env.state
        .acquire_manual(property_id, sync_type, Utc::now())
        .await
}

pub async fn run_manual(
    env: &SyncEnv,
    property_id: &str,
    sync_type: SyncType,
) -> Result<Option<RunReport>> {
    match start_manual(env, property_id, sync_type).await? {
        Some(lease) => execute_run(env, lease).await.map(Some),
        None => Ok(None),
    }
}

async fn run_body(env: &SyncEnv, lease: &RunLease, progress: &mut RunProgress) -> Result<()> {
    match lease.run.sync_type {
        SyncType::Reservations | SyncType::Guests => pull(env, lease, progress).await,
        SyncType::Availability => {
            push_inventory_run(env, lease, progress, InventoryKind::Availability).await
        }
        SyncType::Rates => push_inventory_run(env, lease, progress, InventoryKind::Rates).await,
    }
}

/// Execute the body under the run deadline and record the terminal state.
pub async fn execute_run(env: &SyncEnv, lease: RunLease) -> Result<RunReport> {
    let run = &lease.run;
    let started = Instant::now();
    tracing::info!(
        run_id = %run.id,
        property = %run.property_id,
        sync_type = run.sync_type.as_str(),
        trigger = run.trigger.as_str(),
        retry = run.retry_count,
        "Sync run started"
    );

    let mut progress = RunProgress::starting(env, &lease).await?;
    let deadline = env.settings.run_max_duration;
    let failure = match tokio::time::timeout(deadline, run_body(env, &lease, &mut progress)).await
    {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(compact_text(&error.to_string())),
        Err(_) => Some(format!(
            "run exceeded its {}s time budget",
            deadline.as_secs()
        )),
    };

    let (status, disposition) = match &failure {
        None => {
            if !env
                .state
                .complete(&lease, progress.cursor.clone(), progress.stats)
                .await?
            {
                tracing::warn!(run_id = %run.id, "Run lease lost before completion was recorded");
            }
            (SyncStatus::Completed, None)
        }
        Some(error) => {
            let disposition = env
                .state
                .fail(&lease, progress.cursor.clone(), progress.stats, error)
                .await?;
            (SyncStatus::Failed, Some(disposition))
        }
    };

    tracing::info!(
        run_id = %run.id,
        property = %run.property_id,
        sync_type = run.sync_type.as_str(),
        status = status.as_str(),
        processed = progress.stats.processed,
        created = progress.stats.created,
        updated = progress.stats.updated,
        conflicts = progress.stats.conflicts,
        failed = progress.stats.failed,
        duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Sync run finished"
    );

    Ok(RunReport {
        run_id: run.id,
        property_id: run.property_id.clone(),
        sync_type: run.sync_type,
        status,
        stats: progress.stats,
        cursor: progress.cursor,
        error: failure,
        disposition,
    })
}
