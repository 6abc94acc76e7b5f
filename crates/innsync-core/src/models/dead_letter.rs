//! Outbound jobs that exhausted their redelivery budget

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeEvent, DeadLetterId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub property_id: String,
    pub entity_key: String,
    pub event: ChangeEvent,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    /// Set once an operator re-enqueued the job
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn new(event: ChangeEvent, attempts: u32, last_error: impl Into<String>) -> Self {
        Self {
            id: DeadLetterId::new(),
            property_id: event.property_id.clone(),
            entity_key: event.entity_key(),
            event,
            attempts,
            last_error: last_error.into(),
            created_at: Utc::now(),
            replayed_at: None,
        }
    }
}
