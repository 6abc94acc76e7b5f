//! Sync run state repository implementation
//!
//! All lock transitions are single conditional statements. The partial unique
//! index on running rows backs them up: a statement that would create a second
//! running row for a pair fails and is reported as "not acquired".

#![allow(clippy::cast_possible_wrap)]

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, Value};

use super::row;
use super::schema::Persisted;
use crate::error::{Error, Result};
use crate::models::{RunId, SyncState, SyncStats, SyncStatus, SyncType};
use crate::util::to_millis;

/// Lock claim parameters
#[derive(Debug, Clone)]
pub struct LockClaim {
    pub lock_id: String,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Trait for sync run storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SyncStateRepository {
    /// Mark running rows whose lock expired at `now` as failed. Returns the count.
    async fn reap_expired(
        &self,
        property_id: &str,
        sync_type: SyncType,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Insert `state` as running, only if no valid lock exists for its pair.
    async fn insert_running(&self, state: &SyncState, claim: &LockClaim) -> Result<bool>;

    /// Flip a pending row to running, only if no valid lock exists for its pair.
    async fn claim_pending(&self, id: &RunId, claim: &LockClaim) -> Result<Option<SyncState>>;

    /// Store a pending row (retry schedule)
    async fn insert_pending(&self, state: &SyncState) -> Result<()>;

    /// Persist progress and extend the lock. `false` means the lock was lost.
    async fn checkpoint(
        &self,
        id: &RunId,
        lock_id: &str,
        cursor: Option<&str>,
        stats: &SyncStats,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a running row to a terminal status and release its lock.
    async fn finish(&self, id: &RunId, lock_id: &str, outcome: &RunOutcome) -> Result<bool>;

    /// Cancel a pending or running row
    async fn cancel(&self, id: &RunId, reason: &str) -> Result<bool>;

    /// Cancel pending rows for a pair
    async fn cancel_pending(&self, property_id: &str, sync_type: SyncType, reason: &str)
        -> Result<u64>;

    /// Clear the attention flag on failed rows of a pair
    async fn clear_attention(&self, property_id: &str, sync_type: SyncType) -> Result<u64>;

    async fn get(&self, id: &RunId) -> Result<Option<SyncState>>;

    /// Most recent row of a pair with the given status
    async fn latest_with_status(
        &self,
        property_id: &str,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> Result<Option<SyncState>>;

    /// Most recent terminal row of a pair
    async fn latest_finished(&self, property_id: &str, sync_type: SyncType)
        -> Result<Option<SyncState>>;

    /// Whether the newest failed row of the pair is flagged for an operator
    async fn needs_attention(&self, property_id: &str, sync_type: SyncType) -> Result<bool>;

    /// Runs newest first, optionally for one property
    async fn list(&self, property_id: Option<&str>, limit: usize) -> Result<Vec<SyncState>>;

    /// Number of running rows for a pair
    async fn count_running(&self, property_id: &str, sync_type: SyncType) -> Result<u64>;
}

/// Terminal transition for a running row
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: SyncStatus,
    pub cursor: Option<String>,
    pub stats: SyncStats,
    pub error: Option<String>,
    pub needs_attention: bool,
}

/// libSQL implementation of `SyncStateRepository`
pub struct LibSqlSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse(row: &Row) -> Result<SyncState> {
        Ok(SyncState {
            id: row::parsed(row, 0)?,
            property_id: row::text(row, 1)?,
            sync_type: row::parsed(row, 2)?,
            status: row::parsed(row, 3)?,
            trigger: row::parsed(row, 4)?,
            started_at: row::opt_time(row, 5)?,
            completed_at: row::opt_time(row, 6)?,
            cursor: row::opt_text(row, 7)?,
            stats: row::json(row, 8)?,
            error: row::opt_text(row, 9)?,
            retry_count: row::count(row, 10)?,
            next_retry_at: row::opt_time(row, 11)?,
            lock_id: row::opt_text(row, 12)?,
            lock_expires_at: row::opt_time(row, 13)?,
            needs_attention: row::flag(row, 14)?,
            created_at: row::time(row, 15)?,
            updated_at: row::time(row, 16)?,
        })
    }

    async fn query_many(&self, sql: &str, params: Vec<Value>) -> Result<Vec<SyncState>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut states = Vec::new();
        while let Some(row) = rows.next().await? {
            states.push(Self::parse(&row)?);
        }
        Ok(states)
    }

    async fn query_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<SyncState>> {
        Ok(self.query_many(sql, params).await?.into_iter().next())
    }

    fn row_params(state: &SyncState) -> Result<Vec<Value>> {
        Ok(vec![
            state.id.as_str().into(),
            state.property_id.clone().into(),
            state.sync_type.as_str().into(),
            state.status.as_str().into(),
            state.trigger.as_str().into(),
            state.started_at.map(to_millis).into(),
            state.completed_at.map(to_millis).into(),
            state.cursor.clone().into(),
            serde_json::to_string(&state.stats)?.into(),
            state.error.clone().into(),
            i64::from(state.retry_count).into(),
            state.next_retry_at.map(to_millis).into(),
            state.lock_id.clone().into(),
            state.lock_expires_at.map(to_millis).into(),
            i64::from(state.needs_attention).into(),
            to_millis(state.created_at).into(),
            to_millis(state.updated_at).into(),
        ])
    }

    /// Treat a unique violation on the running index as a lost race
    fn lost_race(result: std::result::Result<u64, libsql::Error>) -> Result<u64> {
        match result {
            Ok(changed) => Ok(changed),
            Err(error) => {
                let error = Error::from(error);
                if error.is_unique_violation() {
                    Ok(0)
                } else {
                    Err(error)
                }
            }
        }
    }
}

impl SyncStateRepository for LibSqlSyncStateRepository<'_> {
    async fn reap_expired(
        &self,
        property_id: &str,
        sync_type: SyncType,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let now = to_millis(now);
        let reaped = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET status = 'failed', error = 'lock expired', completed_at = ?,
                     lock_id = NULL, lock_expires_at = NULL, updated_at = ?
                 WHERE property_id = ? AND sync_type = ? AND status = 'running'
                   AND (lock_expires_at IS NULL OR lock_expires_at <= ?)",
                libsql::params![now, now, property_id, sync_type.as_str(), now],
            )
            .await?;
        Ok(reaped)
    }

    async fn insert_running(&self, state: &SyncState, claim: &LockClaim) -> Result<bool> {
        let mut running = state.clone();
        running.status = SyncStatus::Running;
        running.started_at = Some(claim.now);
        running.lock_id = Some(claim.lock_id.clone());
        running.lock_expires_at = Some(claim.expires_at);

        let mut params = Self::row_params(&running)?;
        params.push(running.property_id.clone().into());
        params.push(running.sync_type.as_str().into());
        params.push(to_millis(claim.now).into());

        let sql = format!(
            "INSERT INTO {} ({}) SELECT {}
             WHERE NOT EXISTS (
                 SELECT 1 FROM sync_states
                 WHERE property_id = ? AND sync_type = ? AND status = 'running'
                   AND lock_expires_at > ?
             )",
            SyncState::TABLE,
            SyncState::COLUMNS.join(", "),
            vec!["?"; SyncState::COLUMNS.len()].join(", ")
        );
        let inserted = Self::lost_race(self.conn.execute(&sql, params).await)?;
        Ok(inserted == 1)
    }

    async fn claim_pending(&self, id: &RunId, claim: &LockClaim) -> Result<Option<SyncState>> {
        let now = to_millis(claim.now);
        let result = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET status = 'running', started_at = ?, lock_id = ?, lock_expires_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_states AS other
                       WHERE other.property_id = sync_states.property_id
                         AND other.sync_type = sync_states.sync_type
                         AND other.status = 'running'
                         AND other.lock_expires_at > ?
                   )",
                libsql::params![
                    now,
                    claim.lock_id.clone(),
                    to_millis(claim.expires_at),
                    now,
                    id.as_str(),
                    now,
                ],
            )
            .await;

        if Self::lost_race(result)? == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn insert_pending(&self, state: &SyncState) -> Result<()> {
        if state.status != SyncStatus::Pending {
            return Err(Error::InvalidInput(format!(
                "expected a pending run, got {}",
                state.status
            )));
        }
        self.conn
            .execute(&SyncState::insert_sql(), Self::row_params(state)?)
            .await?;
        Ok(())
    }

    async fn checkpoint(
        &self,
        id: &RunId,
        lock_id: &str,
        cursor: Option<&str>,
        stats: &SyncStats,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET cursor = ?, stats = ?, lock_expires_at = ?, updated_at = ?
                 WHERE id = ? AND lock_id = ? AND status = 'running'",
                libsql::params![
                    cursor.map(ToString::to_string),
                    serde_json::to_string(stats)?,
                    to_millis(expires_at),
                    to_millis(Utc::now()),
                    id.as_str(),
                    lock_id,
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn finish(&self, id: &RunId, lock_id: &str, outcome: &RunOutcome) -> Result<bool> {
        if !outcome.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{} is not a terminal status",
                outcome.status
            )));
        }
        let now = to_millis(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET status = ?, cursor = ?, stats = ?, error = ?, needs_attention = ?,
                     completed_at = ?, lock_id = NULL, lock_expires_at = NULL, updated_at = ?
                 WHERE id = ? AND lock_id = ? AND status = 'running'",
                libsql::params![
                    outcome.status.as_str(),
                    outcome.cursor.clone(),
                    serde_json::to_string(&outcome.stats)?,
                    outcome.error.clone(),
                    i64::from(outcome.needs_attention),
                    now,
                    now,
                    id.as_str(),
                    lock_id,
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn cancel(&self, id: &RunId, reason: &str) -> Result<bool> {
        let now = to_millis(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET status = 'cancelled', error = ?, completed_at = ?,
                     lock_id = NULL, lock_expires_at = NULL, updated_at = ?
                 WHERE id = ? AND status IN ('pending', 'running')",
                libsql::params![reason, now, now, id.as_str()],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn cancel_pending(
        &self,
        property_id: &str,
        sync_type: SyncType,
        reason: &str,
    ) -> Result<u64> {
        let now = to_millis(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE sync_states
                 SET status = 'cancelled', error = ?, completed_at = ?, updated_at = ?
                 WHERE property_id = ? AND sync_type = ? AND status = 'pending'",
                libsql::params![reason, now, now, property_id, sync_type.as_str()],
            )
            .await?;
        Ok(changed)
    }

    async fn clear_attention(&self, property_id: &str, sync_type: SyncType) -> Result<u64> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_states SET needs_attention = 0, updated_at = ?
                 WHERE property_id = ? AND sync_type = ? AND needs_attention = 1",
                libsql::params![to_millis(Utc::now()), property_id, sync_type.as_str()],
            )
            .await?;
        Ok(changed)
    }

    async fn get(&self, id: &RunId) -> Result<Option<SyncState>> {
        let sql = format!("{} WHERE id = ?", SyncState::select_sql());
        self.query_one(&sql, vec![id.as_str().into()]).await
    }

    async fn latest_with_status(
        &self,
        property_id: &str,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> Result<Option<SyncState>> {
        let sql = format!(
            "{} WHERE property_id = ? AND sync_type = ? AND status = ?
             ORDER BY created_at DESC, id DESC LIMIT 1",
            SyncState::select_sql()
        );
        self.query_one(
            &sql,
            vec![
                property_id.into(),
                sync_type.as_str().into(),
                status.as_str().into(),
            ],
        )
        .await
    }

    async fn latest_finished(
        &self,
        property_id: &str,
        sync_type: SyncType,
    ) -> Result<Option<SyncState>> {
        let sql = format!(
            "{} WHERE property_id = ? AND sync_type = ?
               AND status IN ('completed', 'failed', 'cancelled')
             ORDER BY created_at DESC, id DESC LIMIT 1",
            SyncState::select_sql()
        );
        self.query_one(&sql, vec![property_id.into(), sync_type.as_str().into()])
            .await
    }

    async fn needs_attention(&self, property_id: &str, sync_type: SyncType) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sync_states
                    WHERE property_id = ? AND sync_type = ? AND needs_attention = 1
                 )",
                libsql::params![property_id, sync_type.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row::flag(&row, 0),
            None => Ok(false),
        }
    }

    async fn list(&self, property_id: Option<&str>, limit: usize) -> Result<Vec<SyncState>> {
        let limit = (if limit == 0 { 50 } else { limit }) as i64;
        match property_id {
            Some(property_id) => {
                let sql = format!(
                    "{} WHERE property_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                    SyncState::select_sql()
                );
                self.query_many(&sql, vec![property_id.into(), limit.into()])
                    .await
            }
            None => {
                let sql = format!(
                    "{} ORDER BY created_at DESC, id DESC LIMIT ?",
                    SyncState::select_sql()
                );
                self.query_many(&sql, vec![limit.into()]).await
            }
        }
    }

    async fn count_running(&self, property_id: &str, sync_type: SyncType) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_states
                 WHERE property_id = ? AND sync_type = ? AND status = 'running'",
                libsql::params![property_id, sync_type.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>(0)?).unwrap_or_default()),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::RunTrigger;
    use chrono::Duration;

    fn claim(now: DateTime<Utc>, ttl_secs: i64) -> LockClaim {
        LockClaim {
            lock_id: RunId::new().to_string(),
            now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    fn pending() -> SyncState {
        SyncState::pending("p1", SyncType::Reservations, RunTrigger::Scheduled, 0, None)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_insert_running_is_refused_while_lock_valid() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());
        let now = Utc::now();

        assert!(repo.insert_running(&pending(), &claim(now, 300)).await.unwrap());
        assert!(!repo.insert_running(&pending(), &claim(now, 300)).await.unwrap());
        assert_eq!(
            repo.count_running("p1", SyncType::Reservations).await.unwrap(),
            1
        );

        // A different sync type is independent
        let other = SyncState::pending("p1", SyncType::Guests, RunTrigger::Manual, 0, None);
        assert!(repo.insert_running(&other, &claim(now, 300)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_lock_is_reaped_and_reclaimable() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());
        let then = Utc::now() - Duration::seconds(600);
        let crashed = pending();
        assert!(repo.insert_running(&crashed, &claim(then, 60)).await.unwrap());

        let now = Utc::now();
        assert_eq!(
            repo.reap_expired("p1", SyncType::Reservations, now)
                .await
                .unwrap(),
            1
        );
        let reaped = repo.get(&crashed.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, SyncStatus::Failed);
        assert_eq!(reaped.error.as_deref(), Some("lock expired"));

        assert!(repo.insert_running(&pending(), &claim(now, 60)).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checkpoint_and_finish_require_the_lock_id() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());
        let state = pending();
        let lock = claim(Utc::now(), 300);
        repo.insert_running(&state, &lock).await.unwrap();

        let stats = SyncStats {
            processed: 3,
            ..SyncStats::default()
        };
        assert!(!repo
            .checkpoint(&state.id, "someone-else", Some("c1"), &stats, lock.expires_at)
            .await
            .unwrap());
        assert!(repo
            .checkpoint(&state.id, &lock.lock_id, Some("c1"), &stats, lock.expires_at)
            .await
            .unwrap());

        let outcome = RunOutcome {
            status: SyncStatus::Completed,
            cursor: Some("c2".to_string()),
            stats,
            error: None,
            needs_attention: false,
        };
        assert!(repo.finish(&state.id, &lock.lock_id, &outcome).await.unwrap());
        assert!(!repo.finish(&state.id, &lock.lock_id, &outcome).await.unwrap());

        let done = repo
            .latest_with_status("p1", SyncType::Reservations, SyncStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.cursor.as_deref(), Some("c2"));
        assert_eq!(done.stats.processed, 3);
        assert!(done.lock_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_row_is_claimed_once() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSyncStateRepository::new(db.connection());
        let retry = SyncState::pending(
            "p1",
            SyncType::Reservations,
            RunTrigger::Retry,
            1,
            Some(Utc::now()),
        );
        repo.insert_pending(&retry).await.unwrap();

        let now = Utc::now();
        let claimed = repo
            .claim_pending(&retry.id, &claim(now, 300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, SyncStatus::Running);
        assert_eq!(claimed.retry_count, 1);
        assert!(repo
            .claim_pending(&retry.id, &claim(now, 300))
            .await
            .unwrap()
            .is_none());
    }
}
