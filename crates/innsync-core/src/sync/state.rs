//! Run lifecycle for (property, sync type) pairs.
//!
//! A run holds a time-bounded lease on its pair. Acquisition reaps expired
//! leases first, so a crashed worker blocks its pair for at most one TTL.
//! Failed runs are rescheduled with exponential backoff until the retry
//! ceiling, after which the pair waits for an operator.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channel::BackoffPolicy;
use crate::config::SyncSettings;
use crate::db::{LockClaim, RunOutcome};
use crate::models::{RunTrigger, SyncState, SyncStats, SyncStatus, SyncType};
use crate::services::SyncStore;
use crate::{Error, Result};

/// Exclusive claim on a pair, valid while its lock row is current
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub run: SyncState,
    pub lock_id: String,
}

/// Result of a scheduled acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Lease(RunLease),
    /// Another worker holds a valid lease
    Busy,
    /// Retries are exhausted; only a manual trigger runs the pair again
    NeedsAttention,
    RetryNotDue(DateTime<Utc>),
}

/// What happened to a pair after a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureDisposition {
    RetryScheduled { retry_count: u32, at: DateTime<Utc> },
    NeedsAttention,
    /// The lease expired before the failure was recorded
    LockLost,
}

#[derive(Debug, Clone)]
pub struct SyncStateManager {
    store: SyncStore,
    lock_ttl: chrono::Duration,
    backoff: BackoffPolicy,
    max_retries: u32,
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl SyncStateManager {
    pub fn new(store: SyncStore, settings: &SyncSettings) -> Self {
        Self {
            store,
            lock_ttl: to_chrono(settings.lock_ttl),
            backoff: BackoffPolicy::new(
                settings.retry_base,
                settings.retry_max,
                settings.max_retries.saturating_add(1),
            )
            .with_jitter(),
            max_retries: settings.max_retries,
        }
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn claim(&self, now: DateTime<Utc>) -> LockClaim {
        LockClaim {
            lock_id: Uuid::now_v7().to_string(),
            now,
            expires_at: now + self.lock_ttl,
        }
    }

    async fn reap(&self, property_id: &str, sync_type: SyncType, now: DateTime<Utc>) -> Result<()> {
        let reaped = self.store.reap_expired_runs(property_id, sync_type, now).await?;
        if reaped > 0 {
            tracing::warn!(
                property = property_id,
                sync_type = sync_type.as_str(),
                reaped,
                "Reclaimed expired sync lock"
            );
        }
        Ok(())
    }

    async fn insert_new(
        &self,
        property_id: &str,
        sync_type: SyncType,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<Option<RunLease>> {
        let claim = self.claim(now);
        let state = SyncState::pending(property_id, sync_type, trigger, 0, None);
        if !self.store.insert_running_run(&state, &claim).await? {
            return Ok(None);
        }
        let run = self
            .store
            .get_run(&state.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", state.id)))?;
        Ok(Some(RunLease {
            run,
            lock_id: claim.lock_id,
        }))
    }

    /// Acquire on the scheduler's behalf: a due retry is claimed before a
    /// fresh run is started.
    pub async fn acquire_scheduled(
        &self,
        property_id: &str,
        sync_type: SyncType,
        now: DateTime<Utc>,
    ) -> Result<Acquired> {
        if self.store.needs_attention(property_id, sync_type).await? {
            return Ok(Acquired::NeedsAttention);
        }
        self.reap(property_id, sync_type, now).await?;

        let pending = self
            .store
            .latest_run_with_status(property_id, sync_type, SyncStatus::Pending)
            .await?;
        if let Some(pending) = pending {
            if let Some(at) = pending.next_retry_at.filter(|at| *at > now) {
                return Ok(Acquired::RetryNotDue(at));
            }
            let claim = self.claim(now);
            return Ok(match self.store.claim_pending_run(&pending.id, &claim).await? {
                Some(run) => Acquired::Lease(RunLease {
                    run,
                    lock_id: claim.lock_id,
                }),
                None => Acquired::Busy,
            });
        }

        Ok(
            match self
                .insert_new(property_id, sync_type, RunTrigger::Scheduled, now)
                .await?
            {
                Some(lease) => Acquired::Lease(lease),
                None => Acquired::Busy,
            },
        )
    }

    /// Operator trigger: supersedes pending retries and clears the attention
    /// flag. `None` when a run is already in flight.
    pub async fn acquire_manual(
        &self,
        property_id: &str,
        sync_type: SyncType,
        now: DateTime<Utc>,
    ) -> Result<Option<RunLease>> {
        self.reap(property_id, sync_type, now).await?;
        if self.store.count_running(property_id, sync_type).await? > 0 {
            return Ok(None);
        }

        let lease = self
            .insert_new(property_id, sync_type, RunTrigger::Manual, now)
            .await?;
        if lease.is_some() {
            self.store
                .cancel_pending_runs(property_id, sync_type, "superseded by manual trigger")
                .await?;
            self.store.clear_attention(property_id, sync_type).await?;
        }
        Ok(lease)
    }

    /// Persist progress and extend the lease
    pub async fn heartbeat(
        &self,
        lease: &RunLease,
        cursor: Option<&str>,
        stats: &SyncStats,
    ) -> Result<()> {
        let expires_at = Utc::now() + self.lock_ttl;
        let kept = self
            .store
            .checkpoint_run(&lease.run.id, &lease.lock_id, cursor, stats, expires_at)
            .await?;
        if kept {
            Ok(())
        } else {
            Err(Error::LockUnavailable(format!(
                "lease on run {} was lost",
                lease.run.id
            )))
        }
    }

    pub async fn complete(
        &self,
        lease: &RunLease,
        cursor: Option<String>,
        stats: SyncStats,
    ) -> Result<bool> {
        let outcome = RunOutcome {
            status: SyncStatus::Completed,
            cursor,
            stats,
            error: None,
            needs_attention: false,
        };
        self.store
            .finish_run(&lease.run.id, &lease.lock_id, &outcome)
            .await
    }

    /// Record a failed run and decide what comes next for the pair.
    ///
    /// The retry row inherits `cursor` so it resumes where this run stopped.
    pub async fn fail(
        &self,
        lease: &RunLease,
        cursor: Option<String>,
        stats: SyncStats,
        error: &str,
    ) -> Result<FailureDisposition> {
        let run = &lease.run;
        let exhausted = run.retry_count >= self.max_retries;
        let outcome = RunOutcome {
            status: SyncStatus::Failed,
            cursor: cursor.clone(),
            stats,
            error: Some(error.to_string()),
            needs_attention: exhausted,
        };
        if !self
            .store
            .finish_run(&run.id, &lease.lock_id, &outcome)
            .await?
        {
            tracing::warn!(run_id = %run.id, "Run lease lost before failure was recorded");
            return Ok(FailureDisposition::LockLost);
        }

        if exhausted {
            tracing::error!(
                property = %run.property_id,
                sync_type = run.sync_type.as_str(),
                retries = run.retry_count,
                error,
                "Sync retries exhausted, pair needs attention"
            );
            return Ok(FailureDisposition::NeedsAttention);
        }

        let delay = to_chrono(self.backoff.delay_for(run.retry_count));
        let at = Utc::now() + delay;
        let retry_count = run.retry_count + 1;
        let mut retry = SyncState::pending(
            run.property_id.clone(),
            run.sync_type,
            RunTrigger::Retry,
            retry_count,
            Some(at),
        );
        retry.cursor = cursor;
        self.store.insert_pending_run(&retry).await?;

        tracing::warn!(
            property = %run.property_id,
            sync_type = run.sync_type.as_str(),
            retry_count,
            retry_at = %at,
            error,
            "Sync run failed, retry scheduled"
        );
        Ok(FailureDisposition::RetryScheduled { retry_count, at })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pretty_assertions::assert_eq;

    async fn manager(settings: SyncSettings) -> (SyncStore, SyncStateManager) {
        let store = SyncStore::open_in_memory().await.unwrap();
        let manager = SyncStateManager::new(store.clone(), &settings);
        (store, manager)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manager_debug_includes_store() {
        let (_, manager) = manager(SyncSettings::default()).await;
        let rendered = format!("{manager:?}");
        assert!(rendered.contains("SyncStore"));
        assert!(rendered.contains("max_retries"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_scheduled_acquire_is_busy() {
        let (_, manager) = manager(SyncSettings::default()).await;
        let now = Utc::now();

        let first = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap();
        assert!(matches!(first, Acquired::Lease(_)));

        let second = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap();
        assert_eq!(second, Acquired::Busy);

        let other_type = manager
            .acquire_scheduled("p1", SyncType::Guests, now)
            .await
            .unwrap();
        assert!(matches!(other_type, Acquired::Lease(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_lease_is_reclaimed() {
        let settings = SyncSettings {
            lock_ttl: Duration::from_secs(60),
            ..SyncSettings::default()
        };
        let (store, manager) = manager(settings).await;
        let now = Utc::now();

        let Acquired::Lease(stale) = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap()
        else {
            panic!("expected a lease");
        };

        let later = now + chrono::Duration::seconds(61);
        let fresh = manager
            .acquire_scheduled("p1", SyncType::Reservations, later)
            .await
            .unwrap();
        assert!(matches!(fresh, Acquired::Lease(_)));

        let reaped = store.get_run(&stale.run.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, SyncStatus::Failed);
        assert!(manager.heartbeat(&stale, None, &SyncStats::default()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_schedules_retry_that_resumes_cursor() {
        let settings = SyncSettings {
            max_retries: 2,
            retry_base: Duration::from_secs(30),
            ..SyncSettings::default()
        };
        let (store, manager) = manager(settings).await;
        let now = Utc::now();

        let Acquired::Lease(lease) = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap()
        else {
            panic!("expected a lease");
        };
        let disposition = manager
            .fail(&lease, Some("page-3".into()), SyncStats::default(), "boom")
            .await
            .unwrap();
        let FailureDisposition::RetryScheduled { retry_count, at } = disposition else {
            panic!("expected a retry, got {disposition:?}");
        };
        assert_eq!(retry_count, 1);
        assert!(at > now);

        let not_yet = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap();
        assert!(matches!(not_yet, Acquired::RetryNotDue(_)));

        let due = at + chrono::Duration::seconds(1);
        let Acquired::Lease(retry) = manager
            .acquire_scheduled("p1", SyncType::Reservations, due)
            .await
            .unwrap()
        else {
            panic!("expected the retry lease");
        };
        assert_eq!(retry.run.trigger, RunTrigger::Retry);
        assert_eq!(retry.run.retry_count, 1);
        assert_eq!(retry.run.cursor.as_deref(), Some("page-3"));
        assert_eq!(store.count_running("p1", SyncType::Reservations).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_need_attention_until_manual_trigger() {
        let settings = SyncSettings {
            max_retries: 0,
            ..SyncSettings::default()
        };
        let (store, manager) = manager(settings).await;
        let now = Utc::now();

        let Acquired::Lease(lease) = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap()
        else {
            panic!("expected a lease");
        };
        let disposition = manager
            .fail(&lease, None, SyncStats::default(), "partner down")
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::NeedsAttention);
        assert!(store.needs_attention("p1", SyncType::Reservations).await.unwrap());

        let scheduled = manager
            .acquire_scheduled("p1", SyncType::Reservations, now)
            .await
            .unwrap();
        assert_eq!(scheduled, Acquired::NeedsAttention);

        let manual = manager
            .acquire_manual("p1", SyncType::Reservations, now)
            .await
            .unwrap();
        assert!(manual.is_some());
        assert!(!store.needs_attention("p1", SyncType::Reservations).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_refuses_while_running() {
        let (_, manager) = manager(SyncSettings::default()).await;
        let now = Utc::now();
        let lease = manager
            .acquire_manual("p1", SyncType::Reservations, now)
            .await
            .unwrap()
            .unwrap();
        assert!(manager
            .acquire_manual("p1", SyncType::Reservations, now)
            .await
            .unwrap()
            .is_none());

        assert!(manager
            .complete(&lease, Some("c-1".into()), SyncStats::default())
            .await
            .unwrap());
        assert!(manager
            .acquire_manual("p1", SyncType::Reservations, now)
            .await
            .unwrap()
            .is_some());
    }
}
