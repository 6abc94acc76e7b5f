//! Append-only per-entity operation log

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityType, LogId, RunId};

db_enum! {
    Direction {
        Inbound => "inbound",
        Outbound => "outbound",
    }
}

db_enum! {
    SyncOperation {
        Create => "create",
        Update => "update",
        Cancel => "cancel",
        Retire => "retire",
        Push => "push",
        Noop => "noop",
    }
}

/// One entity-level sync operation. Rows are never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: LogId,
    pub property_id: String,
    pub run_id: Option<RunId>,
    pub operation: SyncOperation,
    pub direction: Direction,
    pub entity_type: EntityType,
    pub local_id: Option<String>,
    pub external_id: Option<String>,
    pub success: bool,
    pub conflict: bool,
    pub duration_ms: i64,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncLog {
    pub fn new(
        property_id: impl Into<String>,
        direction: Direction,
        entity_type: EntityType,
        operation: SyncOperation,
    ) -> Self {
        Self {
            id: LogId::new(),
            property_id: property_id.into(),
            run_id: None,
            operation,
            direction,
            entity_type,
            local_id: None,
            external_id: None,
            success: false,
            conflict: false,
            duration_ms: 0,
            request: None,
            response: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn in_run(mut self, run_id: Option<RunId>) -> Self {
        self.run_id = run_id;
        self
    }

    #[must_use]
    pub const fn with_operation(mut self, operation: SyncOperation) -> Self {
        self.operation = operation;
        self
    }

    #[must_use]
    pub fn with_local_id(mut self, local_id: Option<impl Into<String>>) -> Self {
        self.local_id = local_id.map(Into::into);
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: Option<impl Into<String>>) -> Self {
        self.external_id = external_id.map(Into::into);
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    #[must_use]
    pub const fn flag_conflict(mut self) -> Self {
        self.conflict = true;
        self
    }

    #[must_use]
    pub fn succeeded(mut self, elapsed: Duration) -> Self {
        self.success = true;
        self.duration_ms = duration_ms(elapsed);
        self
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>, elapsed: Duration) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.duration_ms = duration_ms(elapsed);
        self
    }
}

fn duration_ms(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}
