//! Paginated pulls from the channel.

use super::apply::{apply_guest, apply_reservation, ApplyMode};
use super::runner::RunProgress;
use super::state::RunLease;
use super::SyncEnv;
use crate::channel::{ChannelError, ChannelOperation};
use crate::models::SyncType;
use crate::{Error, Result};

/// Pull body for `Reservations` and `Guests` runs.
///
/// Items are applied one by one; the cursor and tallies are checkpointed
/// after every page so a retry resumes from the last complete page.
pub(super) async fn pull(
    env: &SyncEnv,
    lease: &RunLease,
    progress: &mut RunProgress,
) -> Result<()> {
    let run = &lease.run;
    let property_id = run.property_id.as_str();
    let external_property_id = env.external_property_id(property_id)?;
    let page_size = env.settings.page_size;
    let mut pages = 0_u32;

    loop {
        let operation = match run.sync_type {
            SyncType::Guests => ChannelOperation::FetchGuests {
                external_property_id: external_property_id.clone(),
                cursor: progress.cursor.clone(),
                page_size,
            },
            _ => ChannelOperation::FetchReservations {
                external_property_id: external_property_id.clone(),
                cursor: progress.cursor.clone(),
                page_size,
            },
        };
        let body = env.channel.call(&operation, None).await?;
        let page = env.mapper.page(&body)?;
        pages += 1;

        for item in &page.items {
            let outcome = match run.sync_type {
                SyncType::Guests => apply_guest(env, property_id, Some(run.id), item).await?,
                _ => {
                    apply_reservation(env, property_id, Some(run.id), item, ApplyMode::Detect)
                        .await?
                }
            };
            outcome.tally(&mut progress.stats);
        }

        let advanced = page
            .next_cursor
            .as_ref()
            .is_some_and(|next| progress.cursor.as_ref() != Some(next));
        if let Some(next) = page.next_cursor {
            progress.cursor = Some(next);
        }
        env.state
            .heartbeat(lease, progress.cursor.as_deref(), &progress.stats)
            .await?;
        tracing::debug!(
            run_id = %run.id,
            page = pages,
            items = page.items.len(),
            has_more = page.has_more,
            "Pulled page"
        );

        if !page.has_more {
            return Ok(());
        }
        if !advanced {
            return Err(Error::Channel(ChannelError::InvalidPayload(
                "pagination cursor did not advance".to_string(),
            )));
        }
    }
}
