use chrono::{DateTime, SecondsFormat, Utc};

use crate::store::PersistenceError;

/// Fixed-width RFC 3339 so that stored timestamps compare correctly as text.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| PersistenceError::InvalidData(format!("{field} '{value}': {err}")))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32, PersistenceError> {
    u32::try_from(value)
        .map_err(|_| PersistenceError::InvalidData(format!("{field} out of range: {value}")))
}

pub fn to_u16(value: i64, field: &str) -> Result<u16, PersistenceError> {
    u16::try_from(value)
        .map_err(|_| PersistenceError::InvalidData(format!("{field} out of range: {value}")))
}

pub fn to_i32(value: i64, field: &str) -> Result<i32, PersistenceError> {
    i32::try_from(value)
        .map_err(|_| PersistenceError::InvalidData(format!("{field} out of range: {value}")))
}
