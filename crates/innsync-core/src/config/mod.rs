//! Engine settings read from environment-style key/value lookups.
//!
//! Every value has a documented default and a validated range; errors name the
//! offending variable. Conflict policy values can additionally be overridden
//! per property through `property_settings` rows.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::{PropertySettings, SyncType, TimestampWinner};

mod properties;

pub use properties::PropertyDirectory;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Which flows are switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionFlags {
    pub inbound_reservations: bool,
    pub outbound_reservations: bool,
    pub outbound_availability: bool,
    pub outbound_rates: bool,
}

impl Default for DirectionFlags {
    fn default() -> Self {
        Self {
            inbound_reservations: true,
            outbound_reservations: true,
            outbound_availability: true,
            outbound_rates: true,
        }
    }
}

impl DirectionFlags {
    /// Whether runs of `sync_type` may execute
    pub const fn allows(self, sync_type: SyncType) -> bool {
        match sync_type {
            SyncType::Reservations | SyncType::Guests => self.inbound_reservations,
            SyncType::Availability => self.outbound_availability,
            SyncType::Rates => self.outbound_rates,
        }
    }
}

/// Conflict thresholds and tie-breaks in effect for one property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConflictPolicy {
    pub amount_tolerance_percent: f64,
    pub timestamp_winner: TimestampWinner,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            amount_tolerance_percent: 5.0,
            timestamp_winner: TimestampWinner::Manual,
        }
    }
}

/// Global engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub sync_interval: Duration,
    pub directions: DirectionFlags,
    pub conflict: ConflictPolicy,
    /// Run-level retry ceiling before a pair needs operator attention
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub rate_limit_per_window: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_max_wait: Duration,
    pub request_timeout: Duration,
    /// Attempts per channel call, including the first
    pub http_max_attempts: u32,
    pub lock_ttl: Duration,
    pub run_max_duration: Duration,
    pub outbound_workers: usize,
    pub outbound_max_attempts: u32,
    pub page_size: u32,
    pub ari_window_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(15 * 60),
            directions: DirectionFlags::default(),
            conflict: ConflictPolicy::default(),
            max_retries: 5,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3_600),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
            rate_limit_per_window: 60,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_wait: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            http_max_attempts: 4,
            lock_ttl: Duration::from_secs(300),
            run_max_duration: Duration::from_secs(1_800),
            outbound_workers: 4,
            outbound_max_attempts: 5,
            page_size: 100,
            ari_window_days: 90,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let interval_minutes: u64 =
            bounded(&lookup, "INNSYNC_SYNC_INTERVAL_MINUTES", 15, 5..=60)?;

        let directions = DirectionFlags {
            inbound_reservations: flag(&lookup, "INNSYNC_INBOUND_RESERVATIONS", true)?,
            outbound_reservations: flag(&lookup, "INNSYNC_OUTBOUND_RESERVATIONS", true)?,
            outbound_availability: flag(&lookup, "INNSYNC_OUTBOUND_AVAILABILITY", true)?,
            outbound_rates: flag(&lookup, "INNSYNC_OUTBOUND_RATES", true)?,
        };

        let amount_tolerance_percent: f64 =
            bounded(&lookup, "INNSYNC_AMOUNT_TOLERANCE_PERCENT", 5.0, 0.0..=100.0)?;
        let timestamp_winner = match optional_trimmed(&lookup, "INNSYNC_TIMESTAMP_WINNER") {
            Some(value) => value.to_ascii_lowercase().parse().map_err(|_| {
                ConfigError::Invalid(
                    "INNSYNC_TIMESTAMP_WINNER must be one of manual, local, remote".to_string(),
                )
            })?,
            None => TimestampWinner::Manual,
        };

        let max_retries = bounded(&lookup, "INNSYNC_MAX_RETRIES", 5, 0..=20)?;
        let retry_base_secs: u64 = bounded(&lookup, "INNSYNC_RETRY_BASE_SECS", 30, 1..=3_600)?;
        let retry_max_secs: u64 = bounded(&lookup, "INNSYNC_RETRY_MAX_SECS", 3_600, 1..=86_400)?;
        if retry_max_secs < retry_base_secs {
            return Err(ConfigError::Invalid(
                "INNSYNC_RETRY_MAX_SECS must be >= INNSYNC_RETRY_BASE_SECS".to_string(),
            ));
        }

        let circuit_failure_threshold =
            bounded(&lookup, "INNSYNC_CIRCUIT_FAILURE_THRESHOLD", 5, 1..=100)?;
        let circuit_cooldown_secs: u64 =
            bounded(&lookup, "INNSYNC_CIRCUIT_COOLDOWN_SECS", 30, 1..=3_600)?;

        let rate_limit_per_window =
            bounded(&lookup, "INNSYNC_RATE_LIMIT_PER_WINDOW", 60, 1..=10_000)?;
        let rate_limit_window_secs: u64 =
            bounded(&lookup, "INNSYNC_RATE_LIMIT_WINDOW_SECS", 60, 1..=3_600)?;
        let rate_limit_max_wait_secs: u64 =
            bounded(&lookup, "INNSYNC_RATE_LIMIT_MAX_WAIT_SECS", 30, 0..=600)?;

        let request_timeout_secs: u64 =
            bounded(&lookup, "INNSYNC_REQUEST_TIMEOUT_SECS", 15, 1..=120)?;
        let http_max_attempts = bounded(&lookup, "INNSYNC_HTTP_MAX_ATTEMPTS", 4, 1..=10)?;

        let lock_ttl_secs: u64 = bounded(&lookup, "INNSYNC_LOCK_TTL_SECS", 300, 30..=3_600)?;
        let run_max_duration_secs: u64 =
            bounded(&lookup, "INNSYNC_RUN_MAX_DURATION_SECS", 1_800, 60..=86_400)?;

        let outbound_workers = bounded(&lookup, "INNSYNC_OUTBOUND_WORKERS", 4, 1..=64)?;
        let outbound_max_attempts = bounded(&lookup, "INNSYNC_OUTBOUND_MAX_ATTEMPTS", 5, 1..=50)?;
        let page_size = bounded(&lookup, "INNSYNC_PAGE_SIZE", 100, 1..=1_000)?;
        let ari_window_days = bounded(&lookup, "INNSYNC_ARI_WINDOW_DAYS", 90, 1..=730)?;

        Ok(Self {
            sync_interval: Duration::from_secs(interval_minutes * 60),
            directions,
            conflict: ConflictPolicy {
                amount_tolerance_percent,
                timestamp_winner,
            },
            max_retries,
            retry_base: Duration::from_secs(retry_base_secs),
            retry_max: Duration::from_secs(retry_max_secs),
            circuit_failure_threshold,
            circuit_cooldown: Duration::from_secs(circuit_cooldown_secs),
            rate_limit_per_window,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            rate_limit_max_wait: Duration::from_secs(rate_limit_max_wait_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            http_max_attempts,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            run_max_duration: Duration::from_secs(run_max_duration_secs),
            outbound_workers,
            outbound_max_attempts,
            page_size,
            ari_window_days,
        })
    }

    /// Conflict policy for one property: stored overrides win over globals.
    pub fn for_property(&self, overrides: Option<&PropertySettings>) -> ConflictPolicy {
        let Some(overrides) = overrides else {
            return self.conflict;
        };
        ConflictPolicy {
            amount_tolerance_percent: overrides
                .amount_tolerance_percent
                .unwrap_or(self.conflict.amount_tolerance_percent),
            timestamp_winner: overrides
                .timestamp_winner
                .unwrap_or(self.conflict.timestamp_winner),
        }
    }
}

/// Parse `name` as `T`, falling back to `default`, and check it lies in `range`.
pub fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let describe = || {
        format!(
            "{name} must be a number in [{}, {}]",
            range.start(),
            range.end()
        )
    };
    let value = match optional_trimmed(&lookup, name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(describe()))?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(describe()));
    }
    Ok(value)
}

/// Parse a boolean switch (`1/0`, `true/false`, `yes/no`, `on/off`)
pub fn flag(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
    }
}

pub fn value_or_default(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

pub fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(pairs: &[(&str, &str)]) -> Result<SyncSettings, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncSettings::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(settings(&[]).unwrap(), SyncSettings::default());
    }

    #[test]
    fn interval_is_bounded_to_five_through_sixty_minutes() {
        for bad in ["4", "61", "0", "abc"] {
            let err = settings(&[("INNSYNC_SYNC_INTERVAL_MINUTES", bad)]).unwrap_err();
            assert!(err.to_string().contains("INNSYNC_SYNC_INTERVAL_MINUTES"));
        }
        let ok = settings(&[("INNSYNC_SYNC_INTERVAL_MINUTES", "60")]).unwrap();
        assert_eq!(ok.sync_interval, Duration::from_secs(3_600));
    }

    #[test]
    fn direction_flags_parse() {
        let parsed = settings(&[
            ("INNSYNC_OUTBOUND_RATES", "off"),
            ("INNSYNC_INBOUND_RESERVATIONS", "0"),
        ])
        .unwrap();
        assert!(!parsed.directions.outbound_rates);
        assert!(!parsed.directions.allows(SyncType::Reservations));
        assert!(parsed.directions.allows(SyncType::Availability));

        assert!(settings(&[("INNSYNC_OUTBOUND_RATES", "maybe")]).is_err());
    }

    #[test]
    fn conflict_policy_overrides() {
        let parsed = settings(&[
            ("INNSYNC_AMOUNT_TOLERANCE_PERCENT", "7.5"),
            ("INNSYNC_TIMESTAMP_WINNER", "Remote"),
        ])
        .unwrap();
        assert_eq!(parsed.conflict.amount_tolerance_percent, 7.5);
        assert_eq!(parsed.conflict.timestamp_winner, TimestampWinner::Remote);
        assert!(settings(&[("INNSYNC_TIMESTAMP_WINNER", "newest")]).is_err());
    }

    #[test]
    fn property_overrides_win_field_by_field() {
        let global = SyncSettings::default();
        let mut row = PropertySettings::new("p1");
        row.amount_tolerance_percent = Some(1.0);

        let policy = global.for_property(Some(&row));
        assert_eq!(policy.amount_tolerance_percent, 1.0);
        assert_eq!(policy.timestamp_winner, TimestampWinner::Manual);
        assert_eq!(global.for_property(None), global.conflict);
    }

    #[test]
    fn retry_cap_must_cover_base() {
        let err = settings(&[
            ("INNSYNC_RETRY_BASE_SECS", "120"),
            ("INNSYNC_RETRY_MAX_SECS", "60"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("INNSYNC_RETRY_MAX_SECS"));
    }
}
