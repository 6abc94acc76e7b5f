//! Sync mapping model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityType, MappingId};

db_enum! {
    /// Which way data may flow for a mapped pair
    SyncDirection {
        Inbound => "inbound",
        Outbound => "outbound",
        Bidirectional => "bidirectional",
    }
}

impl SyncDirection {
    pub const fn allows_inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Bidirectional)
    }

    pub const fn allows_outbound(self) -> bool {
        matches!(self, Self::Outbound | Self::Bidirectional)
    }
}

db_enum! {
    /// How the local side of a mapping was found
    MatchMethod {
        Mapping => "mapping",
        Email => "email",
        Phone => "phone",
        Created => "created",
        Manual => "manual",
    }
}

db_enum! {
    MatchConfidence {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

/// Persisted link between one local entity and one external entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub id: MappingId,
    pub property_id: String,
    pub entity_type: EntityType,
    pub local_id: String,
    pub external_id: String,
    pub external_property_id: String,
    pub sync_direction: SyncDirection,
    /// Fingerprint of the local entity as of the last successful sync
    pub local_hash: Option<String>,
    /// Fingerprint of the external entity as of the last successful sync
    pub external_hash: Option<String>,
    pub match_method: Option<MatchMethod>,
    pub match_confidence: Option<MatchConfidence>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMapping {
    pub property_id: String,
    pub entity_type: EntityType,
    pub local_id: String,
    pub external_id: String,
    pub external_property_id: String,
    #[serde(default = "default_direction")]
    pub sync_direction: SyncDirection,
    #[serde(default)]
    pub local_hash: Option<String>,
    #[serde(default)]
    pub external_hash: Option<String>,
    #[serde(default)]
    pub match_method: Option<MatchMethod>,
    #[serde(default)]
    pub match_confidence: Option<MatchConfidence>,
}

const fn default_direction() -> SyncDirection {
    SyncDirection::Bidirectional
}

impl SyncMapping {
    /// Build the row for a freshly created mapping
    pub fn from_new(new: NewMapping, synced: bool) -> Self {
        let now = Utc::now();
        Self {
            id: MappingId::new(),
            property_id: new.property_id,
            entity_type: new.entity_type,
            local_id: new.local_id,
            external_id: new.external_id,
            external_property_id: new.external_property_id,
            sync_direction: new.sync_direction,
            local_hash: new.local_hash,
            external_hash: new.external_hash,
            match_method: new.match_method,
            match_confidence: new.match_confidence,
            last_synced_at: synced.then_some(now),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
