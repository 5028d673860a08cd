//! ISO-8601 instant parsing shared by control and entity payloads.
//!
//! Publishers are not consistent about timestamps: the coordinator emits
//! RFC 3339 with an offset, while some entity apps emit naive local-less
//! strings (`2024-01-01T00:00:00` or `2024-01-01 00:00:00.250000`). Naive
//! values are interpreted as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an ISO-8601 instant, treating offset-less values as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) fn de_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_instant(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid ISO-8601 instant '{raw}'")))
}

pub(crate) fn de_opt_instant<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_instant(&raw).map(Some).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid ISO-8601 instant '{raw}'"))
        }),
    }
}
