use std::path::Path;

use crate::commands::common::open_store;
use crate::error::CliError;

/// Opening the store applies any pending migrations.
pub async fn run_migrate(db_path: &Path) -> Result<i32, CliError> {
    let store = open_store(db_path).await?;
    let version = store.schema_version().await?;
    println!("{} is at schema version {version}", db_path.display());
    Ok(version)
}
