//! innsync - operator command line for the channel sync engine
//!
//! Reads the sync database directly; commands that talk to the channel or
//! the PMS build their connections from the same environment as the API.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, ConflictCommands, DeadLetterCommands, MappingCommands};
use crate::commands::common::default_db_path;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve, run_conflicts_show};
use crate::commands::dead_letters::{run_dead_letters_list, run_dead_letters_replay};
use crate::commands::logs::{run_logs, LogsArgs};
use crate::commands::mappings::{
    mapping_filter, run_mappings_create, run_mappings_list, run_mappings_retire, CreateMappingArgs,
};
use crate::commands::migrate::run_migrate;
use crate::commands::pull::run_pull;
use crate::commands::status::{run_cancel, run_runs, run_status};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("innsync_core=warn".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli.db_path.unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Status { property_id, json } => run_status(&property_id, json, &db_path).await?,
        Commands::Runs {
            property,
            limit,
            json,
        } => run_runs(property.as_deref(), limit, json, &db_path).await?,
        Commands::Cancel { run_id, reason } => {
            run_cancel(&run_id, reason.as_deref(), &db_path).await?;
        }
        Commands::Logs {
            property,
            run,
            entity_type,
            external_id,
            failures,
            limit,
            json,
        } => {
            let args = LogsArgs {
                property,
                run,
                entity_type,
                external_id,
                failures,
                limit,
            };
            run_logs(args, json, &db_path).await?;
        }
        Commands::Conflicts { command } => match command {
            ConflictCommands::List {
                property,
                limit,
                json,
            } => run_conflicts_list(property.as_deref(), limit, json, &db_path).await?,
            ConflictCommands::Show { id } => run_conflicts_show(&id, &db_path).await?,
            ConflictCommands::Resolve {
                id,
                action,
                resolved_by,
                take_remote,
            } => {
                run_conflicts_resolve(&id, &action, &resolved_by, &take_remote, &db_path).await?;
            }
        },
        Commands::Mappings { command } => match command {
            MappingCommands::List {
                property,
                entity_type,
                all,
                limit,
                json,
            } => {
                let filter = mapping_filter(property, entity_type.as_deref(), all, limit)?;
                run_mappings_list(filter, json, &db_path).await?;
            }
            MappingCommands::Create {
                property_id,
                entity_type,
                local_id,
                external_id,
                external_property,
                direction,
            } => {
                let args = CreateMappingArgs {
                    property_id,
                    entity_type,
                    local_id,
                    external_id,
                    external_property,
                    direction,
                };
                run_mappings_create(args, &db_path).await?;
            }
            MappingCommands::Retire { id } => run_mappings_retire(&id, &db_path).await?,
        },
        Commands::DeadLetters { command } => match command {
            DeadLetterCommands::List { all, limit, json } => {
                run_dead_letters_list(all, limit, json, &db_path).await?;
            }
            DeadLetterCommands::Replay { id } => run_dead_letters_replay(&id, &db_path).await?,
        },
        Commands::Pull {
            property_id,
            sync_type,
            json,
        } => run_pull(&property_id, &sync_type, json, &db_path).await?,
        Commands::Migrate => {
            run_migrate(&db_path).await?;
        }
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}
