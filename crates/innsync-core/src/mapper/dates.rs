//! Calendar dates on the wire.
//!
//! Stay dates are calendar days, not instants. Canonical `YYYY-MM-DD` text is
//! parsed as a `NaiveDate` directly. Anything else is read in the offset it
//! was written in, and the resulting day is re-anchored to UTC midnight. The
//! host timezone is never consulted, so a server west of UTC cannot shift a
//! date back by one day.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use super::MapError;

const CANONICAL: &str = "%Y-%m-%d";

/// Parse a wire date into a calendar day
pub fn parse_calendar_date(field: &'static str, raw: &str) -> Result<NaiveDate, MapError> {
    let raw = raw.trim();
    let invalid = || MapError::InvalidField {
        field,
        value: raw.to_string(),
    };

    if raw.len() == 10 {
        if let Ok(date) = NaiveDate::parse_from_str(raw, CANONICAL) {
            return Ok(date);
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y/%m/%d") {
            return Ok(date);
        }
    }
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|_| invalid());
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(stamp.date_naive());
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(stamp.date());
    }
    Err(invalid())
}

/// Canonical wire form of a calendar day
pub fn format_calendar_date(date: NaiveDate) -> String {
    date.format(CANONICAL).to_string()
}

/// The instant a calendar day starts, in UTC
pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Parse then re-serialize; canonical input is returned unchanged.
pub fn normalize_calendar_date(field: &'static str, raw: &str) -> Result<String, MapError> {
    parse_calendar_date(field, raw).map(format_calendar_date)
}

/// Parse an instant (`updated_at` style field)
pub fn parse_instant(field: &'static str, raw: &str) -> Result<DateTime<Utc>, MapError> {
    let raw = raw.trim();
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(stamp.with_timezone(&Utc));
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(stamp.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, CANONICAL) {
        return Ok(utc_midnight(date));
    }
    Err(MapError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(raw: &str) -> String {
        normalize_calendar_date("arrival", raw).unwrap()
    }

    #[test]
    fn canonical_dates_pass_through() {
        assert_eq!(day("2025-01-29"), "2025-01-29");
        assert_eq!(day(" 2025-01-29 "), "2025-01-29");
    }

    #[test]
    fn negative_offset_stamps_keep_their_day() {
        assert_eq!(day("2025-01-29T00:00:00-05:00"), "2025-01-29");
        assert_eq!(day("2025-01-29T23:30:00-08:00"), "2025-01-29");
        assert_eq!(day("2025-01-29T00:00:00Z"), "2025-01-29");
        assert_eq!(day("2025-01-29T00:00:00"), "2025-01-29");
    }

    #[test]
    fn alternative_layouts() {
        assert_eq!(day("2025/01/29"), "2025-01-29");
        assert_eq!(day("20250129"), "2025-01-29");
    }

    #[test]
    fn unparseable_dates_are_rejected() {
        for raw in ["", "29.01.2025", "2025-02-30", "tomorrow"] {
            assert!(parse_calendar_date("arrival", raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn round_trip_through_utc_midnight() {
        let date = parse_calendar_date("arrival", "2025-01-29").unwrap();
        let midnight = utc_midnight(date);
        assert_eq!(midnight.to_rfc3339(), "2025-01-29T00:00:00+00:00");
        assert_eq!(format_calendar_date(midnight.date_naive()), "2025-01-29");
    }

    #[test]
    fn instants_are_normalized_to_utc() {
        let stamp = parse_instant("updated_at", "2025-01-29T10:00:00+02:00").unwrap();
        assert_eq!(stamp.to_rfc3339(), "2025-01-29T08:00:00+00:00");
    }
}
