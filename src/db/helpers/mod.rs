use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} holds out-of-range value {value}"))
}

/// Fixed-width UTC timestamps, so text order matches time order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

/// Rows keep the entity as a JSON body next to the indexed columns.
pub fn encode_body<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to encode {what}"))
}

pub fn decode_body<T: DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    serde_json::from_str(body).with_context(|| format!("stored {what} is unreadable"))
}
