//! Shared utility functions used across multiple modules.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Unix milliseconds for a UTC timestamp, as stored in every table.
pub fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

/// Inverse of [`to_millis`]. Out-of-range values clamp to the epoch.
pub fn from_millis(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Stable content fingerprint of a serializable value.
///
/// `serde_json` serializes struct fields in declaration order and maps via
/// `BTreeMap`, so equal values always hash equally.
pub fn content_hash<T: Serialize>(value: &T) -> crate::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Lowercased, trimmed email, or `None` when it is not shaped like one.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(email)
}

/// Digits-only phone number, keeping an international `+` prefix.
///
/// A leading `00` is read as `+`. Numbers with fewer than 7 digits are
/// rejected as unusable for matching.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let (international, digits) = if raw.starts_with('+') {
        (true, digits.as_str())
    } else if let Some(rest) = digits.strip_prefix("00") {
        (true, rest)
    } else {
        (false, digits.as_str())
    };
    if digits.len() < 7 {
        return None;
    }
    Some(if international {
        format!("+{digits}")
    } else {
        digits.to_string()
    })
}
