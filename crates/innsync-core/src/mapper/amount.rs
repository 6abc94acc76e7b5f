//! Decimal money amounts on the wire, integer minor units locally

use serde_json::Value;

use super::MapError;

/// `"120.00"`, `"120"` or `120.5` into cents. JSON numbers are major units.
/// Digits past the second decimal round half-up.
pub fn parse_amount(field: &'static str, value: &Value) -> Result<i64, MapError> {
    let invalid = || MapError::InvalidField {
        field,
        value: value.to_string(),
    };
    match value {
        Value::String(text) => decimal_to_cents(text).ok_or_else(invalid),
        Value::Number(number) => {
            if let Some(whole) = number.as_i64() {
                return whole.checked_mul(100).ok_or_else(invalid);
            }
            let major = number.as_f64().ok_or_else(invalid)?;
            let cents = (major * 100.0).round();
            if cents.is_finite() && cents.abs() < 9.0e15 {
                #[allow(clippy::cast_possible_truncation)]
                Ok(cents as i64)
            } else {
                Err(invalid())
            }
        }
        _ => Err(invalid()),
    }
}

fn decimal_to_cents(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = text
        .strip_prefix('-')
        .map_or((false, text), |rest| (true, rest));
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut fraction_digits = fraction.bytes().map(|b| i64::from(b - b'0'));
    let tens = fraction_digits.next().unwrap_or(0);
    let ones = fraction_digits.next().unwrap_or(0);
    let round_up = fraction_digits.next().is_some_and(|digit| digit >= 5);

    let cents = whole
        .checked_mul(100)?
        .checked_add(tens * 10 + ones + i64::from(round_up))?;
    Some(if negative { -cents } else { cents })
}

/// Cents as a two-decimal string
pub fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Relative difference in percent, measured against the local amount
#[allow(clippy::cast_precision_loss)]
pub fn percent_difference(local_cents: i64, remote_cents: i64) -> f64 {
    if local_cents == remote_cents {
        return 0.0;
    }
    if local_cents == 0 {
        return 100.0;
    }
    let delta = i128::from(remote_cents) - i128::from(local_cents);
    (delta as f64 / local_cents as f64).abs() * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_decimal_forms() {
        assert_eq!(parse_amount("total", &json!("120.00")).unwrap(), 12_000);
        assert_eq!(parse_amount("total", &json!("120")).unwrap(), 12_000);
        assert_eq!(parse_amount("total", &json!("99.9")).unwrap(), 9_990);
        assert_eq!(parse_amount("total", &json!("10.005")).unwrap(), 1_001);
        assert_eq!(parse_amount("total", &json!("-5.25")).unwrap(), -525);
        assert_eq!(parse_amount("total", &json!(120.5)).unwrap(), 12_050);
        assert_eq!(parse_amount("total", &json!(80)).unwrap(), 8_000);
    }

    #[test]
    fn rejects_garbage() {
        for value in [json!("12,50"), json!("abc"), json!("."), json!(null), json!(true)] {
            assert!(parse_amount("total", &value).is_err(), "{value}");
        }
    }

    #[test]
    fn formats_two_decimals() {
        assert_eq!(format_amount(12_000), "120.00");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(-525), "-5.25");
    }

    #[test]
    fn percent_difference_is_relative_to_local() {
        assert!((percent_difference(10_000, 12_000) - 20.0).abs() < f64::EPSILON);
        assert!((percent_difference(10_000, 10_400) - 4.0).abs() < 1e-9);
        assert!(percent_difference(5_000, 5_000).abs() < f64::EPSILON);
    }

    #[test]
    fn percent_difference_survives_extreme_amounts() {
        assert!((percent_difference(i64::MIN, i64::MAX) - 200.0).abs() < 1e-9);
        assert!((percent_difference(-1, i64::MAX) - 9.223_372_036_854_776e20).abs() < 1e6);
        assert!(percent_difference(i64::MAX, i64::MAX).abs() < f64::EPSILON);
    }
}
