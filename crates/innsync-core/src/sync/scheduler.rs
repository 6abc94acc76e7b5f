//! Periodic pulls per (property, sync type).

use chrono::{DateTime, Utc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use super::runner::{run_scheduled, RunReport};
use super::webhook::sweep_unprocessed;
use super::SyncEnv;
use crate::models::{SyncStatus, SyncType};
use crate::Result;

/// Unprocessed webhooks retried per tick
const WEBHOOK_SWEEP_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Due {
    Now,
    Later,
}

#[derive(Clone)]
pub struct Scheduler {
    env: SyncEnv,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("interval", &self.env.settings.sync_interval)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub const fn new(env: SyncEnv) -> Self {
        Self { env }
    }

    /// Pull pairs this process schedules
    pub fn pairs(&self) -> Vec<(String, SyncType)> {
        let directions = self.env.settings.directions;
        self.env
            .properties
            .property_ids()
            .flat_map(|property_id| {
                [SyncType::Reservations, SyncType::Guests]
                    .into_iter()
                    .filter(move |sync_type| directions.allows(*sync_type))
                    .map(move |sync_type| (property_id.to_string(), sync_type))
            })
            .collect()
    }

    async fn due(&self, property_id: &str, sync_type: SyncType, now: DateTime<Utc>) -> Result<Due> {
        let store = &self.env.store;
        // Pending retries carry their own schedule; the state manager decides.
        if store
            .latest_run_with_status(property_id, sync_type, SyncStatus::Pending)
            .await?
            .is_some()
        {
            return Ok(Due::Now);
        }
        let interval = chrono::Duration::from_std(self.env.settings.sync_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        Ok(match store.latest_finished_run(property_id, sync_type).await? {
            Some(last) if last.created_at + interval > now => Due::Later,
            _ => Due::Now,
        })
    }

    /// Start every due pair concurrently and wait for them
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<RunReport> {
        let mut runs = JoinSet::new();
        for (property_id, sync_type) in self.pairs() {
            match self.due(&property_id, sync_type, now).await {
                Ok(Due::Now) => {}
                Ok(Due::Later) => continue,
                Err(error) => {
                    tracing::error!(
                        property = %property_id,
                        sync_type = sync_type.as_str(),
                        error = %error,
                        "Could not read sync schedule"
                    );
                    continue;
                }
            }
            let env = self.env.clone();
            runs.spawn(async move {
                let result = run_scheduled(&env, &property_id, sync_type).await;
                (property_id, sync_type, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((_, _, Ok(Some(report)))) => reports.push(report),
                Ok((_, _, Ok(None))) => {}
                Ok((property_id, sync_type, Err(error))) => {
                    tracing::error!(
                        property = %property_id,
                        sync_type = sync_type.as_str(),
                        error = %error,
                        "Scheduled sync errored"
                    );
                }
                Err(error) => tracing::error!(error = %error, "Scheduled sync task panicked"),
            }
        }
        reports
    }

    /// Background loop: one tick per minute plus a webhook sweep
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                pairs = self.pairs().len(),
                interval_secs = self.env.settings.sync_interval.as_secs(),
                "Scheduler started"
            );
            loop {
                interval.tick().await;
                let reports = self.tick(Utc::now()).await;
                if !reports.is_empty() {
                    tracing::debug!(runs = reports.len(), "Scheduler tick finished");
                }
                if let Err(error) = sweep_unprocessed(&self.env, WEBHOOK_SWEEP_LIMIT).await {
                    tracing::error!(error = %error, "Webhook sweep failed");
                }
            }
        })
    }
}
