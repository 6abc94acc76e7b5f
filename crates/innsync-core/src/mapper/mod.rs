//! Translation between PMS domain objects and a channel's wire format.
//!
//! Mappers are pure: no I/O, no clock, no host timezone. Each direction is
//! total over its input type and reports missing or malformed fields as
//! [`MapError`] instead of panicking.

mod amount;
mod dates;
mod generic;
mod status;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    AvailabilityDay, Guest, GuestInput, Origin, RateDay, Reservation, ReservationInput,
    ReservationStatus,
};
use crate::util::content_hash;

pub use amount::{format_amount, parse_amount, percent_difference};
pub use dates::{
    format_calendar_date, normalize_calendar_date, parse_calendar_date, parse_instant,
    utc_midnight,
};
pub use generic::{GenericMapper, GenericRouter};
pub use status::{lookup_status, status_from_external, status_to_external, STATUS_FALLBACK};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl From<MapError> for crate::Error {
    fn from(error: MapError) -> Self {
        Self::Validation(error.to_string())
    }
}

/// Customer record as the channel describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGuest {
    pub external_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ExternalGuest {
    pub fn to_input(&self) -> GuestInput {
        GuestInput {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
        }
    }

    pub fn fingerprint(&self) -> crate::Result<String> {
        content_hash(self)
    }
}

/// Booking as the channel describes it, already normalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReservation {
    pub external_id: String,
    pub external_property_id: Option<String>,
    pub status: ReservationStatus,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub adults: u32,
    pub children: u32,
    pub total_amount_cents: i64,
    pub currency: String,
    pub channel_code: Option<String>,
    pub room_type_external_id: Option<String>,
    pub customer: Option<ExternalGuest>,
    pub notes: Option<String>,
    /// Remote last-modified, when the channel reports one
    pub updated_at: Option<DateTime<Utc>>,
}

/// Hash input: everything but the remote bookkeeping timestamp
#[derive(Serialize)]
struct ReservationFingerprint<'a> {
    status: ReservationStatus,
    check_in: NaiveDate,
    check_out: NaiveDate,
    adults: u32,
    children: u32,
    total_amount_cents: i64,
    currency: &'a str,
    channel_code: Option<&'a str>,
    room_type_external_id: Option<&'a str>,
    customer: Option<&'a ExternalGuest>,
    notes: Option<&'a str>,
}

impl ExternalReservation {
    pub fn fingerprint(&self) -> crate::Result<String> {
        content_hash(&ReservationFingerprint {
            status: self.status,
            check_in: self.check_in,
            check_out: self.check_out,
            adults: self.adults,
            children: self.children,
            total_amount_cents: self.total_amount_cents,
            currency: &self.currency,
            channel_code: self.channel_code.as_deref(),
            room_type_external_id: self.room_type_external_id.as_deref(),
            customer: self.customer.as_ref(),
            notes: self.notes.as_deref(),
        })
    }

    /// Writable local fields for this booking.
    ///
    /// `base` is the current local record when one exists: its origin and any
    /// link the channel did not resolve are kept.
    pub fn to_input(
        &self,
        guest_id: Option<String>,
        room_type_id: Option<String>,
        base: Option<&Reservation>,
    ) -> ReservationInput {
        ReservationInput {
            guest_id: guest_id.or_else(|| base.and_then(|r| r.guest_id.clone())),
            room_type_id: room_type_id.or_else(|| base.and_then(|r| r.room_type_id.clone())),
            status: self.status,
            check_in: self.check_in,
            check_out: self.check_out,
            adults: self.adults,
            children: self.children,
            total_amount_cents: self.total_amount_cents,
            currency: self.currency.clone(),
            origin: base.map_or(Origin::Channel, |r| r.origin),
            channel_code: self
                .channel_code
                .clone()
                .or_else(|| base.and_then(|r| r.channel_code.clone())),
            notes: self.notes.clone(),
        }
    }
}

/// Fingerprint of the local side of a reservation mapping
pub fn local_reservation_hash(reservation: &Reservation) -> crate::Result<String> {
    content_hash(&reservation.to_input())
}

/// Fingerprint of the local side of a guest mapping
pub fn local_guest_hash(guest: &Guest) -> crate::Result<String> {
    content_hash(&guest.to_input())
}

/// One page of a paginated fetch. Items stay raw so each can fail validation
/// on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// What a webhook is about
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookSubject {
    /// Booking change; `data` is the inline record when the event carries one
    Reservation {
        external_id: String,
        data: Option<Value>,
    },
    Guest {
        data: Value,
    },
    /// Event types this engine does not act on
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotice {
    pub external_property_id: Option<String>,
    pub subject: WebhookSubject,
}

/// Local reservation plus the references the wire format needs
#[derive(Debug, Clone, Copy)]
pub struct OutboundReservation<'a> {
    pub reservation: &'a Reservation,
    pub guest: Option<&'a Guest>,
    pub room_type_external_id: Option<&'a str>,
}

/// Bidirectional translation for one channel's wire schema
pub trait ChannelMapper: Send + Sync {
    fn reservation_to_external(&self, outbound: OutboundReservation<'_>) -> Value;

    fn reservation_from_external(&self, value: &Value) -> Result<ExternalReservation, MapError>;

    fn guest_from_external(&self, value: &Value) -> Result<ExternalGuest, MapError>;

    fn availability_to_external(&self, room_type_external_id: &str, days: &[AvailabilityDay])
        -> Value;

    fn rates_to_external(&self, room_type_external_id: &str, days: &[RateDay]) -> Value;

    fn page(&self, body: &Value) -> Result<Page, MapError>;

    /// External id assigned by a create call
    fn created_external_id(&self, response: &Value) -> Option<String>;

    /// Event id and type of a raw webhook body
    fn webhook_envelope(&self, body: &Value) -> Result<(String, String), MapError>;

    fn parse_webhook(&self, event_type: &str, payload: &Value) -> Result<WebhookNotice, MapError>;
}
