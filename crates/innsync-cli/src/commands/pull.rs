use std::path::Path;

use innsync_core::models::{SyncStatus, SyncType};
use innsync_core::sync::run_manual;

use crate::commands::common::{connect, print_json};
use crate::error::CliError;

pub async fn run_pull(
    property_id: &str,
    sync_type: &str,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let sync_type: SyncType = sync_type.parse()?;
    let env = connect(db_path).await?;
    let report = run_manual(&env, property_id, sync_type)
        .await?
        .ok_or_else(|| CliError::AlreadyRunning(format!("{property_id}/{sync_type}")))?;

    if as_json {
        return print_json(&report);
    }
    let stats = report.stats;
    println!(
        "{} {} run {}: processed={} created={} updated={} unchanged={} conflicts={} failed={}",
        report.property_id,
        report.sync_type,
        report.status,
        stats.processed,
        stats.created,
        stats.updated,
        stats.unchanged,
        stats.conflicts,
        stats.failed,
    );
    if report.status == SyncStatus::Failed {
        return Err(CliError::RunFailed(
            report.error.unwrap_or_else(|| report.run_id.to_string()),
        ));
    }
    Ok(())
}
