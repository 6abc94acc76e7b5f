//! Column decoding helpers shared by the repositories

use std::str::FromStr;

use chrono::{DateTime, Utc};
use libsql::Row;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::util::from_millis;

pub fn text(row: &Row, idx: i32) -> Result<String> {
    Ok(row.get::<String>(idx)?)
}

pub fn opt_text(row: &Row, idx: i32) -> Result<Option<String>> {
    Ok(row.get::<Option<String>>(idx)?)
}

pub fn flag(row: &Row, idx: i32) -> Result<bool> {
    Ok(row.get::<i64>(idx)? != 0)
}

pub fn count(row: &Row, idx: i32) -> Result<u32> {
    let value = row.get::<i64>(idx)?;
    u32::try_from(value).map_err(|_| Error::Database(format!("column {idx} out of range: {value}")))
}

pub fn time(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    Ok(from_millis(row.get::<i64>(idx)?))
}

pub fn opt_time(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    Ok(row.get::<Option<i64>>(idx)?.map(from_millis))
}

/// Parse a text column through its `FromStr` impl (enums and ids)
pub fn parsed<T>(row: &Row, idx: i32) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = text(row, idx)?;
    value
        .parse()
        .map_err(|error| Error::Database(format!("bad value `{value}` in column {idx}: {error}")))
}

pub fn opt_parsed<T>(row: &Row, idx: i32) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match opt_text(row, idx)? {
        Some(value) => value.parse().map(Some).map_err(|error| {
            Error::Database(format!("bad value `{value}` in column {idx}: {error}"))
        }),
        None => Ok(None),
    }
}

pub fn json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<T> {
    Ok(serde_json::from_str(&text(row, idx)?)?)
}

pub fn opt_json<T: DeserializeOwned>(row: &Row, idx: i32) -> Result<Option<T>> {
    opt_text(row, idx)?
        .map(|value| serde_json::from_str(&value))
        .transpose()
        .map_err(Into::into)
}
