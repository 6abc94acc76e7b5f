//! Table metadata for every persisted record type
//!
//! Each record declares its table, its column list and how rows leave the
//! live set. Repositories build their `SELECT` lists from [`Persisted::COLUMNS`]
//! and only filter on a deletion column when [`Persisted::DELETION`] declares
//! one, so no query can assume a column the table does not have.

use crate::models::{
    Conflict, DeadLetter, PropertySettings, SyncLog, SyncMapping, SyncState, WebhookEvent,
};

/// How rows of a table stop being live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Rows are retired by clearing an integer flag column
    SoftFlag { column: &'static str },
    /// Rows are never updated or removed
    AppendOnly,
    /// Rows stay forever; the named column records that they are finished
    Terminal { column: &'static str },
    /// Rows may be deleted outright
    Hard,
}

impl DeletionPolicy {
    /// Predicate selecting live rows, if the table has one
    pub fn live_filter(self) -> Option<String> {
        match self {
            Self::SoftFlag { column } => Some(format!("{column} = 1")),
            Self::AppendOnly | Self::Terminal { .. } | Self::Hard => None,
        }
    }
}

/// A record type stored in one table
pub trait Persisted {
    const TABLE: &'static str;
    /// Columns in the order the repository decodes them
    const COLUMNS: &'static [&'static str];
    const DELETION: DeletionPolicy;

    /// `SELECT <columns> FROM <table>`
    fn select_sql() -> String {
        format!("SELECT {} FROM {}", Self::COLUMNS.join(", "), Self::TABLE)
    }

    /// `INSERT INTO <table> (<columns>) VALUES (?, ...)`
    fn insert_sql() -> String {
        let placeholders = vec!["?"; Self::COLUMNS.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            Self::TABLE,
            Self::COLUMNS.join(", ")
        )
    }
}

impl Persisted for SyncMapping {
    const TABLE: &'static str = "sync_mappings";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "property_id",
        "entity_type",
        "local_id",
        "external_id",
        "external_property_id",
        "sync_direction",
        "local_hash",
        "external_hash",
        "match_method",
        "match_confidence",
        "last_synced_at",
        "active",
        "created_at",
        "updated_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::SoftFlag { column: "active" };
}

impl Persisted for SyncState {
    const TABLE: &'static str = "sync_states";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "property_id",
        "sync_type",
        "status",
        "trigger",
        "started_at",
        "completed_at",
        "cursor",
        "stats",
        "error",
        "retry_count",
        "next_retry_at",
        "lock_id",
        "lock_expires_at",
        "needs_attention",
        "created_at",
        "updated_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::Terminal { column: "status" };
}

impl Persisted for SyncLog {
    const TABLE: &'static str = "sync_logs";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "property_id",
        "run_id",
        "operation",
        "direction",
        "entity_type",
        "local_id",
        "external_id",
        "success",
        "conflict",
        "duration_ms",
        "request",
        "response",
        "error",
        "created_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::AppendOnly;
}

impl Persisted for Conflict {
    const TABLE: &'static str = "conflicts";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "property_id",
        "entity_type",
        "local_id",
        "external_id",
        "mapping_id",
        "conflict_type",
        "origin",
        "local_snapshot",
        "remote_snapshot",
        "resolution_strategy",
        "resolved_by",
        "resolved_at",
        "resolution_action",
        "detail",
        "created_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::Terminal {
        column: "resolved_at",
    };
}

impl Persisted for WebhookEvent {
    const TABLE: &'static str = "webhook_events";
    const COLUMNS: &'static [&'static str] = &[
        "event_id",
        "event_type",
        "payload",
        "processed",
        "error",
        "attempts",
        "received_at",
        "processed_at",
        "claimed_until",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::Terminal { column: "processed" };
}

impl Persisted for DeadLetter {
    const TABLE: &'static str = "outbound_dead_letters";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "property_id",
        "entity_key",
        "event",
        "attempts",
        "last_error",
        "created_at",
        "replayed_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::Terminal {
        column: "replayed_at",
    };
}

impl Persisted for PropertySettings {
    const TABLE: &'static str = "property_settings";
    const COLUMNS: &'static [&'static str] = &[
        "property_id",
        "amount_tolerance_percent",
        "timestamp_winner",
        "updated_at",
    ];
    const DELETION: DeletionPolicy = DeletionPolicy::Hard;
}
