use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use innsync_core::config::{PropertyDirectory, SyncSettings};
use innsync_core::models::{Conflict, DeadLetter, SyncLog, SyncMapping, SyncState};
use innsync_core::services::SyncStore;
use innsync_core::sync::SyncEnv;
use innsync_core::ConnectionConfig;
use serde::Serialize;

use crate::error::CliError;

pub fn default_db_path() -> PathBuf {
    if let Some(path) = env::var_os("INNSYNC_DATABASE_PATH").filter(|path| !path.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("innsync")
        .join("innsync.db")
}

pub async fn open_store(path: &Path) -> Result<SyncStore, CliError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SyncStore::open_path(path.to_path_buf()).await?)
}

/// Store plus partner connections, for commands that talk to the channel or PMS
pub async fn connect(path: &Path) -> Result<SyncEnv, CliError> {
    let store = open_store(path).await?;
    let connection = ConnectionConfig::from_env()?;
    let settings = SyncSettings::from_env()?;
    Ok(connection.connect(store, settings)?)
}

/// Property directory from INNSYNC_PROPERTIES, empty when unset
pub fn property_directory() -> Result<PropertyDirectory, CliError> {
    let raw = env::var("INNSYNC_PROPERTIES").unwrap_or_default();
    Ok(PropertyDirectory::parse(&raw)?)
}

pub fn parse_id<T: FromStr>(what: &'static str, raw: &str) -> Result<T, CliError> {
    raw.trim().parse().map_err(|_| CliError::InvalidId {
        what,
        value: raw.to_string(),
    })
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_relative_time(value: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(value).num_milliseconds().max(0);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_run_line(run: &SyncState, now: DateTime<Utc>) -> String {
    let when = run
        .completed_at
        .or(run.started_at)
        .unwrap_or(run.created_at);
    let mut line = format!(
        "{}  {:<12} {:<9} {:<9} {:<9} processed={} created={} updated={} conflicts={} failed={}",
        run.id,
        run.sync_type,
        run.status,
        run.trigger,
        format_relative_time(when, now),
        run.stats.processed,
        run.stats.created,
        run.stats.updated,
        run.stats.conflicts,
        run.stats.failed,
    );
    if run.needs_attention {
        line.push_str("  NEEDS ATTENTION");
    }
    if let Some(error) = &run.error {
        line.push_str("  error=");
        line.push_str(error);
    }
    line
}

pub fn format_log_lines(logs: &[SyncLog]) -> Vec<String> {
    logs.iter()
        .map(|log| {
            format!(
                "{}  {:<3} {:<8} {:<11} {:<6} local={} external={}{}",
                format_timestamp(log.created_at),
                if log.success { "ok" } else { "ERR" },
                log.direction,
                log.entity_type,
                log.operation,
                log.local_id.as_deref().unwrap_or("-"),
                log.external_id.as_deref().unwrap_or("-"),
                log.error
                    .as_deref()
                    .map(|error| format!("  {error}"))
                    .unwrap_or_default(),
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<9} {:<11} external={} local={}  {}",
                conflict.id,
                conflict.conflict_type,
                conflict.entity_type,
                conflict.external_id,
                conflict.local_id.as_deref().unwrap_or("-"),
                conflict.detail.as_deref().unwrap_or(""),
            )
        })
        .collect()
}

pub fn format_mapping_lines(mappings: &[SyncMapping]) -> Vec<String> {
    mappings
        .iter()
        .map(|mapping| {
            format!(
                "{}  {:<11} {} <-> {}  {}{}",
                mapping.id,
                mapping.entity_type,
                mapping.local_id,
                mapping.external_id,
                mapping.sync_direction,
                if mapping.active { "" } else { "  (retired)" },
            )
        })
        .collect()
}

pub fn format_dead_letter_lines(letters: &[DeadLetter]) -> Vec<String> {
    letters
        .iter()
        .map(|letter| {
            format!(
                "{}  {}  {} {}  attempts={}  {}{}",
                letter.id,
                format_timestamp(letter.created_at),
                letter.event.operation,
                letter.entity_key,
                letter.attempts,
                letter.last_error,
                if letter.replayed_at.is_some() {
                    "  (replayed)"
                } else {
                    ""
                },
            )
        })
        .collect()
}
