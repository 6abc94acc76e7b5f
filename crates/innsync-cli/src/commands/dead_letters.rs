use std::path::Path;

use innsync_core::models::DeadLetterId;
use innsync_core::sync::{process_job, JobOutcome, OutboundJob};

use crate::commands::common::{connect, format_dead_letter_lines, open_store, parse_id, print_json};
use crate::error::CliError;

pub async fn run_dead_letters_list(
    include_replayed: bool,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let letters = store.list_dead_letters(include_replayed, limit).await?;
    if as_json {
        return print_json(&letters);
    }
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }
    for line in format_dead_letter_lines(&letters) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_dead_letters_replay(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id: DeadLetterId = parse_id("dead letter id", id)?;
    let env = connect(db_path).await?;
    let letter = env
        .store
        .get_dead_letter(&id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("dead letter {id}")))?;
    if letter.replayed_at.is_some() {
        return Err(CliError::ReplayFailed(format!("{id} was already replayed")));
    }

    let outcome = process_job(
        &env,
        OutboundJob {
            event: letter.event,
            replay_of: Some(letter.id),
        },
    )
    .await;
    match outcome {
        JobOutcome::Delivered => {
            println!("Delivered {}", letter.entity_key);
            Ok(())
        }
        JobOutcome::Rejected => Err(CliError::ReplayFailed(
            "the channel rejected the change; see `innsync logs --failures`".to_string(),
        )),
        JobOutcome::DeadLettered(again) => Err(CliError::ReplayFailed(format!(
            "retries exhausted again, new dead letter {again}"
        ))),
    }
}
