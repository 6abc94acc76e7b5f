//! Sync run state model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunId;

db_enum! {
    /// Unit of scheduling and locking, paired with a property
    SyncType {
        Reservations => "reservations",
        Guests => "guests",
        Availability => "availability",
        Rates => "rates",
    }
}

impl SyncType {
    /// Pull types fetch from the channel; the others push PMS inventory out.
    pub const fn is_pull(self) -> bool {
        matches!(self, Self::Reservations | Self::Guests)
    }
}

db_enum! {
    /// `pending → running → {completed, failed, cancelled}`
    SyncStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl SyncStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

db_enum! {
    /// What created a run
    RunTrigger {
        Scheduled => "scheduled",
        Manual => "manual",
        Retry => "retry",
        Outbound => "outbound",
    }
}

/// Per-run tallies, stored as JSON on the run row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub conflicts: u32,
    pub failed: u32,
}

impl SyncStats {
    /// Fold another batch into this one
    pub fn merge(&mut self, other: Self) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }
}

/// One sync run for a (property, sync type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: RunId,
    pub property_id: String,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub trigger: RunTrigger,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque incremental token returned by the channel
    pub cursor: Option<String>,
    pub stats: SyncStats,
    pub error: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lock_id: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Retries exhausted; an operator has to trigger the pair manually
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    /// A `pending` run, optionally scheduled for later
    pub fn pending(
        property_id: impl Into<String>,
        sync_type: SyncType,
        trigger: RunTrigger,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            property_id: property_id.into(),
            sync_type,
            status: SyncStatus::Pending,
            trigger,
            started_at: None,
            completed_at: None,
            cursor: None,
            stats: SyncStats::default(),
            error: None,
            retry_count,
            next_retry_at,
            lock_id: None,
            lock_expires_at: None,
            needs_attention: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_merge_adds_fields() {
        let mut total = SyncStats {
            processed: 2,
            created: 1,
            ..SyncStats::default()
        };
        total.merge(SyncStats {
            processed: 3,
            failed: 1,
            conflicts: 1,
            ..SyncStats::default()
        });
        assert_eq!(total.processed, 5);
        assert_eq!(total.created, 1);
        assert_eq!(total.failed, 1);
        assert_eq!(total.conflicts, 1);
    }

    #[test]
    fn stats_tolerate_missing_fields() {
        let stats: SyncStats = serde_json::from_str(r#"{"processed": 4}"#).unwrap();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn pull_types() {
        assert!(SyncType::Reservations.is_pull());
        assert!(!SyncType::Rates.is_pull());
        assert!(SyncStatus::Cancelled.is_terminal());
        assert!(!SyncStatus::Running.is_terminal());
    }
}
