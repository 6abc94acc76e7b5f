//! Sharded outbound queue.
//!
//! Events are routed to a worker by their entity key, so changes to one
//! entity are pushed in the order they were enqueued while unrelated
//! entities proceed in parallel. Redelivery happens inside the worker,
//! which keeps a shard's order intact across retries.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::outbound::{push_change, PushMode};
use super::{is_retryable, SyncEnv};
use crate::channel::BackoffPolicy;
use crate::models::{ChangeEntity, ChangeEvent, DeadLetter, DeadLetterId, SyncLog};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundJob {
    pub event: ChangeEvent,
    /// Set when an operator re-enqueued a dead letter
    pub replay_of: Option<DeadLetterId>,
}

impl From<ChangeEvent> for OutboundJob {
    fn from(event: ChangeEvent) -> Self {
        Self {
            event,
            replay_of: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Delivered,
    /// Permanent failure; logged, not retried
    Rejected,
    DeadLettered(DeadLetterId),
}

#[derive(Clone)]
pub struct OutboundQueue {
    shards: Arc<Vec<mpsc::UnboundedSender<OutboundJob>>>,
    env: SyncEnv,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

/// Redelivery schedule for outbound jobs
fn redelivery(env: &SyncEnv) -> BackoffPolicy {
    BackoffPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(60),
        env.settings.outbound_max_attempts.max(1),
    )
    .with_jitter()
}

pub fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let shards = u64::try_from(shards.max(1)).unwrap_or(1);
    usize::try_from(hasher.finish() % shards).unwrap_or(0)
}

impl OutboundQueue {
    /// Spawn one worker per configured shard
    pub fn start(env: SyncEnv) -> (Self, Vec<JoinHandle<()>>) {
        let workers = env.settings.outbound_workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);
            handles.push(tokio::spawn(worker(env.clone(), shard, rx)));
        }
        tracing::info!(workers, "Outbound workers started");
        (
            Self {
                shards: Arc::new(shards),
                env,
            },
            handles,
        )
    }

    /// Queue a PMS change. Returns `false` when its flow is switched off.
    pub fn submit(&self, event: ChangeEvent) -> Result<bool> {
        let directions = self.env.settings.directions;
        let enabled = match event.entity {
            ChangeEntity::Reservation => directions.outbound_reservations,
            ChangeEntity::Availability => directions.outbound_availability,
            ChangeEntity::Rate => directions.outbound_rates,
            ChangeEntity::RoomType => {
                directions.outbound_availability || directions.outbound_rates
            }
        };
        if !enabled {
            tracing::debug!(
                property = %event.property_id,
                entity = event.entity.as_str(),
                "Outbound flow disabled, change ignored"
            );
            return Ok(false);
        }
        self.enqueue(OutboundJob::from(event))?;
        Ok(true)
    }

    pub fn enqueue(&self, job: OutboundJob) -> Result<()> {
        let shard = shard_for(&job.event.entity_key(), self.shards.len());
        self.shards[shard]
            .send(job)
            .map_err(|_| Error::InvalidInput("outbound queue has shut down".to_string()))
    }
}

async fn worker(env: SyncEnv, shard: usize, mut rx: mpsc::UnboundedReceiver<OutboundJob>) {
    while let Some(job) = rx.recv().await {
        let outcome = process_job(&env, job).await;
        tracing::debug!(shard, outcome = ?outcome, "Outbound job finished");
    }
    tracing::debug!(shard, "Outbound worker stopped");
}

async fn record(env: &SyncEnv, log: &SyncLog) {
    if let Err(error) = env.store.append_log(log).await {
        tracing::error!(error = %error, "Could not record outbound log");
    }
}

/// Deliver one job with redelivery, writing exactly one log row for it.
pub async fn process_job(env: &SyncEnv, job: OutboundJob) -> JobOutcome {
    let policy = redelivery(env);
    let event = &job.event;
    let mut attempts = 0_u32;

    loop {
        attempts += 1;
        match push_change(env, event, None, PushMode::IfChanged).await {
            Ok(log) => {
                record(env, &log).await;
                if let Some(letter) = &job.replay_of {
                    if let Err(error) = env.store.mark_dead_letter_replayed(letter).await {
                        tracing::warn!(
                            dead_letter = %letter,
                            error = %error,
                            "Could not mark dead letter replayed"
                        );
                    }
                }
                return JobOutcome::Delivered;
            }
            Err(failure) if is_retryable(&failure.error) && policy.allows_another(attempts) => {
                let delay = policy.delay_for(attempts - 1);
                tracing::warn!(
                    entity = %event.entity_key(),
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure.error,
                    "Outbound push failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(failure) if is_retryable(&failure.error) => {
                let letter = DeadLetter::new(event.clone(), attempts, failure.error.to_string());
                let id = letter.id;
                if let Err(error) = env.store.insert_dead_letter(&letter).await {
                    tracing::error!(error = %error, "Could not store dead letter");
                }
                tracing::error!(
                    entity = %event.entity_key(),
                    attempts,
                    dead_letter = %id,
                    error = %failure.error,
                    "Outbound push dead-lettered"
                );
                let mut log = failure.log;
                log.error = Some(format!(
                    "dead-lettered after {attempts} attempts: {}",
                    log.error.unwrap_or_default()
                ));
                record(env, &log).await;
                return JobOutcome::DeadLettered(id);
            }
            Err(failure) => {
                tracing::warn!(
                    entity = %event.entity_key(),
                    error = %failure.error,
                    "Outbound push rejected"
                );
                record(env, &failure.log).await;
                return JobOutcome::Rejected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::channel::testing::ScriptedTransport;
    use crate::db::LogFilter;
    use crate::models::{ChangeOperation, Origin};
    use crate::sync::testing::{fast_settings, local_reservation, TestHarness, PROPERTY};
    use pretty_assertions::assert_eq;

    fn created(id: &str) -> ChangeEvent {
        ChangeEvent {
            property_id: PROPERTY.to_string(),
            entity: ChangeEntity::Reservation,
            entity_id: id.to_string(),
            operation: ChangeOperation::Created,
            occurred_at: Utc::now(),
            range: None,
        }
    }

    #[test]
    fn shard_is_stable_per_key() {
        let key = "p1:reservation:r-1";
        assert_eq!(shard_for(key, 8), shard_for(key, 8));
        assert!(shard_for(key, 8) < 8);
        assert_eq!(shard_for(key, 0), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_job_is_dead_lettered_with_one_log() {
        let transport = ScriptedTransport::new().with_fallback(503, json!({"error": "down"}));
        let settings = crate::config::SyncSettings {
            outbound_max_attempts: 2,
            http_max_attempts: 1,
            ..fast_settings()
        };
        let harness = TestHarness::build(transport, settings).await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-1", Origin::Pms));

        let outcome = process_job(&harness.env, OutboundJob::from(created("r-1"))).await;
        let JobOutcome::DeadLettered(id) = outcome else {
            panic!("expected a dead letter, got {outcome:?}");
        };

        let letter = harness.store().get_dead_letter(&id).await.unwrap().unwrap();
        assert_eq!(letter.attempts, 2);
        assert_eq!(letter.event.entity_id, "r-1");

        let logs = harness
            .store()
            .list_logs(&LogFilter {
                limit: 10,
                ..LogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].error.as_deref().unwrap().starts_with("dead-lettered after 2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_changes_reach_the_channel() {
        let transport = ScriptedTransport::new().with_fallback(201, json!({"id": "BK-1"}));
        let harness = TestHarness::build(transport, fast_settings()).await.unwrap();
        harness
            .pms
            .insert_reservation(local_reservation("r-1", Origin::Pms));

        let (queue, workers) = OutboundQueue::start(harness.env.clone());
        assert!(queue.submit(created("r-1")).unwrap());

        let mut mapped = None;
        for _ in 0..100 {
            mapped = harness
                .store()
                .find_mapping_by_local(PROPERTY, crate::models::EntityType::Reservation, "r-1")
                .await
                .unwrap();
            if mapped.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mapped.unwrap().external_id, "BK-1");
        for worker in workers {
            worker.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_flow_is_not_queued() {
        let mut settings = fast_settings();
        settings.directions.outbound_reservations = false;
        let harness = TestHarness::build(ScriptedTransport::new(), settings)
            .await
            .unwrap();
        let (queue, workers) = OutboundQueue::start(harness.env.clone());
        assert!(!queue.submit(created("r-1")).unwrap());
        for worker in workers {
            worker.abort();
        }
    }
}
