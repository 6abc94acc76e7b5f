use std::path::Path;

use innsync_core::models::{ConflictId, ResolutionAction};
use innsync_core::sync::{resolve_conflict, MergeField, ResolutionRequest};

use crate::commands::common::{
    connect, format_conflict_lines, format_timestamp, open_store, parse_id, print_json,
};
use crate::error::CliError;

pub async fn run_conflicts_list(
    property_id: Option<&str>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = store.list_open_conflicts(property_id, limit).await?;
    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No open conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_show(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id: ConflictId = parse_id("conflict id", id)?;
    let store = open_store(db_path).await?;
    let conflict = store
        .get_conflict(&id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("conflict {id}")))?;
    let history = store
        .conflict_history(
            &conflict.property_id,
            conflict.entity_type,
            &conflict.external_id,
        )
        .await?;

    print_json(&serde_json::json!({
        "conflict": conflict,
        "history": history,
    }))
}

/// Parse the resolve arguments into a request
pub fn resolution_request(
    action: &str,
    resolved_by: &str,
    take_remote: &[String],
) -> Result<ResolutionRequest, CliError> {
    let action: ResolutionAction = action.parse()?;
    let take_remote = take_remote
        .iter()
        .map(|field| field.parse::<MergeField>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResolutionRequest {
        action,
        resolved_by: resolved_by.to_string(),
        take_remote,
    })
}

pub async fn run_conflicts_resolve(
    id: &str,
    action: &str,
    resolved_by: &str,
    take_remote: &[String],
    db_path: &Path,
) -> Result<(), CliError> {
    let id: ConflictId = parse_id("conflict id", id)?;
    let request = resolution_request(action, resolved_by, take_remote)?;
    let env = connect(db_path).await?;
    let report = resolve_conflict(&env, &id, &request).await?;
    println!(
        "Resolved conflict {} with {} at {} ({} closed)",
        report.conflict_id,
        report.action,
        format_timestamp(chrono::Utc::now()),
        report.closed
    );
    if let Some(outcome) = report.inbound {
        println!("  applied remote: {outcome:?}");
    }
    if let Some(operation) = report.outbound {
        println!("  pushed local: {operation}");
    }
    Ok(())
}
