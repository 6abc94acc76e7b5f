//! PMS domain objects as seen by the sync engine
//!
//! The PMS owns these records. innsync only reads them, and writes them back
//! through [`crate::pms::PmsGateway`] when applying inbound data.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

db_enum! {
    /// Kind of entity a mapping, log or conflict refers to
    EntityType {
        Reservation => "reservation",
        RoomType => "room_type",
        Guest => "guest",
    }
}

db_enum! {
    /// PMS-side reservation lifecycle
    ReservationStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        CheckedIn => "checked_in",
        CheckedOut => "checked_out",
        Cancelled => "cancelled",
        NoShow => "no_show",
    }
}

db_enum! {
    /// Which system a booking originated in
    Origin {
        Pms => "pms",
        Channel => "channel",
    }
}

/// Half-open stay range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> crate::Result<Self> {
        if end < start {
            return Err(crate::Error::Validation(format!(
                "date range ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Each calendar day in the range, end excluded
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |day| *day < self.end)
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub property_id: String,
    pub guest_id: Option<String>,
    pub room_type_id: Option<String>,
    pub status: ReservationStatus,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub adults: u32,
    pub children: u32,
    /// Total price in minor currency units
    pub total_amount_cents: i64,
    pub currency: String,
    pub origin: Origin,
    /// OTA the booking came through, when channel-originated
    pub channel_code: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub const fn stay(&self) -> DateRange {
        DateRange {
            start: self.check_in,
            end: self.check_out,
        }
    }

    /// Writable fields of this reservation
    pub fn to_input(&self) -> ReservationInput {
        ReservationInput {
            guest_id: self.guest_id.clone(),
            room_type_id: self.room_type_id.clone(),
            status: self.status,
            check_in: self.check_in,
            check_out: self.check_out,
            adults: self.adults,
            children: self.children,
            total_amount_cents: self.total_amount_cents,
            currency: self.currency.clone(),
            origin: self.origin,
            channel_code: self.channel_code.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Writable reservation fields, used for both create and update.
///
/// This is also the canonical form hashed into `SyncMapping::local_hash`, so
/// PMS bookkeeping fields (`updated_at`, ids) never cause a spurious change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationInput {
    pub guest_id: Option<String>,
    pub room_type_id: Option<String>,
    pub status: ReservationStatus,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub adults: u32,
    pub children: u32,
    pub total_amount_cents: i64,
    pub currency: String,
    pub origin: Origin,
    pub channel_code: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: String,
    pub property_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Guest {
    pub fn to_input(&self) -> GuestInput {
        GuestInput {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInput {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: String,
    pub property_id: String,
    pub code: String,
    pub name: String,
    pub max_occupancy: u32,
    pub updated_at: DateTime<Utc>,
}

/// Sellable inventory of one room type on one night
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDay {
    pub room_type_id: String,
    pub date: NaiveDate,
    pub available: u32,
    pub stop_sell: bool,
}

/// Nightly price of one room type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDay {
    pub room_type_id: String,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub currency: String,
}

db_enum! {
    /// What a PMS change event is about
    ChangeEntity {
        Reservation => "reservation",
        RoomType => "room_type",
        Availability => "availability",
        Rate => "rate",
    }
}

db_enum! {
    ChangeOperation {
        Created => "created",
        Updated => "updated",
        Cancelled => "cancelled",
        Deleted => "deleted",
    }
}

/// One entry of the PMS change-event stream.
///
/// For availability and rate events `entity_id` is the room type id and
/// `range` bounds the affected nights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub property_id: String,
    #[serde(alias = "entity_type")]
    pub entity: ChangeEntity,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub range: Option<DateRange>,
}

impl ChangeEvent {
    /// Ordering key: events sharing a key must be applied in order.
    pub fn entity_key(&self) -> String {
        let scope = match self.entity {
            ChangeEntity::Reservation => "reservation",
            ChangeEntity::RoomType | ChangeEntity::Availability | ChangeEntity::Rate => "room_type",
        };
        format!("{}:{scope}:{}", self.property_id, self.entity_id)
    }
}
