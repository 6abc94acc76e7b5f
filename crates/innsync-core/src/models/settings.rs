//! Per-property overrides of the conflict policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

db_enum! {
    /// Which side wins a timestamp conflict
    TimestampWinner {
        Manual => "manual",
        Local => "local",
        Remote => "remote",
    }
}

/// Overrides stored in `property_settings`. `None` falls back to the global value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySettings {
    pub property_id: String,
    #[serde(default)]
    pub amount_tolerance_percent: Option<f64>,
    #[serde(default)]
    pub timestamp_winner: Option<TimestampWinner>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PropertySettings {
    pub fn new(property_id: impl Into<String>) -> Self {
        Self {
            property_id: property_id.into(),
            amount_tolerance_percent: None,
            timestamp_winner: None,
            updated_at: Utc::now(),
        }
    }
}
