//! Reservation status codes.
//!
//! One explicit table in both directions. Inbound aliases some brokers send
//! are listed separately. An unknown inbound code falls back to
//! [`STATUS_FALLBACK`] and is logged; there is no other inference.

use crate::models::ReservationStatus;

/// Local status and its wire code
const STATUS_TABLE: &[(ReservationStatus, &str)] = &[
    (ReservationStatus::Pending, "pending"),
    (ReservationStatus::Confirmed, "confirmed"),
    (ReservationStatus::CheckedIn, "checked_in"),
    (ReservationStatus::CheckedOut, "checked_out"),
    (ReservationStatus::Cancelled, "cancelled"),
    (ReservationStatus::NoShow, "no_show"),
];

/// Additional inbound spellings
const INBOUND_ALIASES: &[(&str, ReservationStatus)] = &[
    ("tentative", ReservationStatus::Pending),
    ("new", ReservationStatus::Confirmed),
    ("booked", ReservationStatus::Confirmed),
    ("modified", ReservationStatus::Confirmed),
    ("in_house", ReservationStatus::CheckedIn),
    ("departed", ReservationStatus::CheckedOut),
    ("canceled", ReservationStatus::Cancelled),
    ("noshow", ReservationStatus::NoShow),
];

/// Used for inbound codes absent from both tables
pub const STATUS_FALLBACK: ReservationStatus = ReservationStatus::Pending;

pub fn status_to_external(status: ReservationStatus) -> &'static str {
    STATUS_TABLE
        .iter()
        .find(|(local, _)| *local == status)
        .map_or("pending", |(_, code)| code)
}

/// Map a wire code; `None` when the code is unknown
pub fn lookup_status(code: &str) -> Option<ReservationStatus> {
    let code = code.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    STATUS_TABLE
        .iter()
        .find(|(_, wire)| *wire == code)
        .map(|(local, _)| *local)
        .or_else(|| {
            INBOUND_ALIASES
                .iter()
                .find(|(alias, _)| *alias == code)
                .map(|(_, local)| *local)
        })
}

/// Map a wire code, falling back for unknown codes
pub fn status_from_external(code: &str) -> ReservationStatus {
    lookup_status(code).unwrap_or_else(|| {
        tracing::warn!(
            code,
            fallback = STATUS_FALLBACK.as_str(),
            "Unknown channel reservation status, using fallback"
        );
        STATUS_FALLBACK
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_local_status_round_trips() {
        for status in ReservationStatus::ALL {
            assert_eq!(
                status_from_external(status_to_external(*status)),
                *status
            );
        }
    }

    #[test]
    fn aliases_and_spelling_variants() {
        assert_eq!(lookup_status("CANCELED"), Some(ReservationStatus::Cancelled));
        assert_eq!(lookup_status("checked-in"), Some(ReservationStatus::CheckedIn));
        assert_eq!(lookup_status("No Show"), Some(ReservationStatus::NoShow));
    }

    #[test]
    fn unknown_codes_use_declared_fallback() {
        assert_eq!(lookup_status("waitlisted"), None);
        assert_eq!(status_from_external("waitlisted"), STATUS_FALLBACK);
    }
}
