//! Sync conflict model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ConflictId, EntityType, MappingId, Origin};

db_enum! {
    ConflictType {
        /// Local side was modified after the remote's reported modification
        Timestamp => "timestamp",
        /// Mapped statuses disagree
        Status => "status",
        /// Stay dates differ
        Range => "range",
        /// Totals differ beyond the configured tolerance
        Amount => "amount",
    }
}

db_enum! {
    ResolutionStrategy {
        /// Resolved by policy when detected
        Auto => "auto",
        /// Waiting for an operator
        Manual => "manual",
        /// Closed by an operator action
        Resolved => "resolved",
    }
}

db_enum! {
    ResolutionAction {
        AcceptLocal => "accept_local",
        AcceptRemote => "accept_remote",
        Merge => "merge",
    }
}

/// Divergence between the local and remote snapshot of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub property_id: String,
    pub entity_type: EntityType,
    pub local_id: Option<String>,
    pub external_id: String,
    pub mapping_id: Option<MappingId>,
    pub conflict_type: ConflictType,
    /// Where the booking originated; selects the resolution policy row
    pub origin: Origin,
    pub local_snapshot: Value,
    pub remote_snapshot: Value,
    pub resolution_strategy: ResolutionStrategy,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_action: Option<ResolutionAction>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conflict {
    /// Open conflicts are the manual queue
    pub fn is_open(&self) -> bool {
        self.resolution_strategy == ResolutionStrategy::Manual
    }
}

/// Detected divergence, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConflict {
    pub property_id: String,
    pub entity_type: EntityType,
    pub local_id: Option<String>,
    pub external_id: String,
    pub mapping_id: Option<MappingId>,
    pub conflict_type: ConflictType,
    pub origin: Origin,
    pub local_snapshot: Value,
    pub remote_snapshot: Value,
    pub detail: Option<String>,
}

impl NewConflict {
    /// Persistable row queued for an operator
    pub fn into_manual(self) -> Conflict {
        self.into_conflict(ResolutionStrategy::Manual, None)
    }

    /// Persistable row already resolved by policy
    pub fn into_auto(self, action: ResolutionAction) -> Conflict {
        self.into_conflict(ResolutionStrategy::Auto, Some(action))
    }

    fn into_conflict(
        self,
        strategy: ResolutionStrategy,
        action: Option<ResolutionAction>,
    ) -> Conflict {
        let now = Utc::now();
        let auto = strategy == ResolutionStrategy::Auto;
        Conflict {
            id: ConflictId::new(),
            property_id: self.property_id,
            entity_type: self.entity_type,
            local_id: self.local_id,
            external_id: self.external_id,
            mapping_id: self.mapping_id,
            conflict_type: self.conflict_type,
            origin: self.origin,
            local_snapshot: self.local_snapshot,
            remote_snapshot: self.remote_snapshot,
            resolution_strategy: strategy,
            resolved_by: auto.then(|| "policy".to_string()),
            resolved_at: auto.then_some(now),
            resolution_action: action,
            detail: self.detail,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected() -> NewConflict {
        NewConflict {
            property_id: "p1".to_string(),
            entity_type: EntityType::Reservation,
            local_id: Some("r-1".to_string()),
            external_id: "BK-1".to_string(),
            mapping_id: None,
            conflict_type: ConflictType::Status,
            origin: Origin::Channel,
            local_snapshot: serde_json::json!({"status": "confirmed"}),
            remote_snapshot: serde_json::json!({"status": "cancelled"}),
            detail: None,
        }
    }

    #[test]
    fn auto_conflicts_are_closed_on_creation() {
        let conflict = detected().into_auto(ResolutionAction::AcceptRemote);
        assert!(!conflict.is_open());
        assert!(conflict.resolved_at.is_some());
        assert_eq!(conflict.resolved_by.as_deref(), Some("policy"));
    }

    #[test]
    fn manual_conflicts_stay_open() {
        let conflict = detected().into_manual();
        assert!(conflict.is_open());
        assert!(conflict.resolved_at.is_none());
        assert!(conflict.resolution_action.is_none());
    }
}
