use std::path::Path;

use chrono::Utc;
use innsync_core::models::{RunId, SyncState, SyncStatus, SyncType};
use innsync_core::services::SyncStore;
use serde::Serialize;

use crate::commands::common::{format_run_line, open_store, parse_id, print_json};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct PairSummary {
    pub sync_type: SyncType,
    pub running: Option<SyncState>,
    pub last_run: Option<SyncState>,
    pub pending_retry: Option<SyncState>,
    pub needs_attention: bool,
}

/// Latest state of every sync type, read from the store only
pub async fn pair_summaries(
    store: &SyncStore,
    property_id: &str,
) -> Result<Vec<PairSummary>, CliError> {
    let mut pairs = Vec::with_capacity(SyncType::ALL.len());
    for &sync_type in SyncType::ALL {
        pairs.push(PairSummary {
            sync_type,
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

pub async fn run_status(property_id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let pairs = pair_summaries(&store, property_id).await?;
    if as_json {
        return print_json(&pairs);
    }

    let now = Utc::now();
    for pair in &pairs {
        let attention = if pair.needs_attention {
            "  NEEDS ATTENTION"
        } else {
            ""
        };
        println!("{}{attention}", pair.sync_type);
        match (&pair.running, &pair.last_run) {
            (None, None) => println!("  never run"),
            (running, last) => {
                if let Some(run) = running {
                    println!("  active: {}", format_run_line(run, now));
                }
                if let Some(run) = last {
                    println!("  last:   {}", format_run_line(run, now));
                }
            }
        }
        if let Some(retry) = &pair.pending_retry {
            let at = retry
                .next_retry_at
                .map_or_else(|| "now".to_string(), |at| at.to_rfc3339());
            println!("  retry #{} scheduled for {at}", retry.retry_count);
        }
    }
    Ok(())
}

pub async fn run_runs(
    property_id: Option<&str>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let runs = store.list_runs(property_id, limit).await?;
    if as_json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }
    let now = Utc::now();
    for run in &runs {
        println!("{}  {}", run.property_id, format_run_line(run, now));
    }
    Ok(())
}

/// Cancel a pending or running run. A running one loses its lock; its
/// worker fails its next state write and stops.
pub async fn run_cancel(
    run_id: &str,
    reason: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let id: RunId = parse_id("run id", run_id)?;
    let store = open_store(db_path).await?;
    let run = store
        .get_run(&id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("run {id}")))?;
    let reason = reason.unwrap_or("cancelled by operator");
    if !store.cancel_run(&id, reason).await? {
        return Err(CliError::NotCancellable(format!("{id} is {}", run.status)));
    }
    println!("Cancelled {} {} run {id}", run.property_id, run.sync_type);
    Ok(())
}
