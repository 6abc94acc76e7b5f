use std::path::Path;

use innsync_core::db::LogFilter;
use innsync_core::models::{EntityType, RunId};

use crate::commands::common::{format_log_lines, open_store, parse_id, print_json};
use crate::error::CliError;

#[derive(Debug, Default)]
pub struct LogsArgs {
    pub property: Option<String>,
    pub run: Option<String>,
    pub entity_type: Option<String>,
    pub external_id: Option<String>,
    pub failures: bool,
    pub limit: usize,
}

impl LogsArgs {
    pub fn filter(self) -> Result<LogFilter, CliError> {
        let run_id = self
            .run
            .as_deref()
            .map(|raw| parse_id::<RunId>("run id", raw))
            .transpose()?;
        let entity_type = self
            .entity_type
            .as_deref()
            .map(str::parse::<EntityType>)
            .transpose()?;
        Ok(LogFilter {
            property_id: self.property,
            run_id,
            entity_type,
            local_id: None,
            external_id: self.external_id,
            failures_only: self.failures,
            limit: self.limit,
        })
    }
}

pub async fn run_logs(args: LogsArgs, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let filter = args.filter()?;
    let store = open_store(db_path).await?;
    let logs = store.list_logs(&filter).await?;
    if as_json {
        return print_json(&logs);
    }
    if logs.is_empty() {
        println!("No sync log entries match.");
        return Ok(());
    }
    for line in format_log_lines(&logs) {
        println!("{line}");
    }
    Ok(())
}
