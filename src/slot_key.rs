//! Canonical keys for cross-referencing slot records and booking records.
//!
//! Dates reach the engine in several shapes: native instants, ISO strings, and
//! store timestamps that carry their own conversion. Each shape is a variant of
//! [`DateInput`]; conversion happens once at the boundary.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A value that knows how to turn itself into an instant.
pub trait ToDate {
    fn to_date(&self) -> Option<DateTime<Utc>>;
}

/// Store-native timestamp (`{seconds, nanoseconds}` in documents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTimestamp {
    pub seconds: i64,
    #[serde(default)]
    pub nanoseconds: u32,
}

impl ToDate for StoreTimestamp {
    fn to_date(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanoseconds)
    }
}

impl From<DateTime<Utc>> for StoreTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanoseconds: dt.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateInput {
    Instant(DateTime<Utc>),
    Day(NaiveDate),
    Iso(String),
    Timestamp(StoreTimestamp),
}

impl DateInput {
    /// Resolve the calendar day, or `None` if the input does not describe one.
    pub fn to_day(&self) -> Option<NaiveDate> {
        match self {
            DateInput::Instant(dt) => Some(dt.date_naive()),
            DateInput::Day(d) => Some(*d),
            DateInput::Iso(s) => parse_iso_day(s),
            DateInput::Timestamp(ts) => ts.to_date().map(|dt| dt.date_naive()),
        }
    }

    /// Boundary conversion from a raw document field.
    ///
    /// Strings are ISO, objects with `seconds` (or `_seconds`) are store
    /// timestamps, integers are unix milliseconds.
    pub fn from_json(value: &Value) -> Option<DateInput> {
        match value {
            Value::String(s) => Some(DateInput::Iso(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .map(DateInput::Instant),
            Value::Object(map) => {
                let seconds = map
                    .get("seconds")
                    .or_else(|| map.get("_seconds"))
                    .and_then(Value::as_i64)?;
                let nanoseconds = match map.get("nanoseconds").or_else(|| map.get("_nanoseconds")) {
                    None => 0,
                    Some(v) => u32::try_from(v.as_u64()?).ok()?,
                };
                Some(DateInput::Timestamp(StoreTimestamp {
                    seconds,
                    nanoseconds,
                }))
            }
            _ => None,
        }
    }
}

impl From<DateTime<Utc>> for DateInput {
    fn from(dt: DateTime<Utc>) -> Self {
        DateInput::Instant(dt)
    }
}

impl From<NaiveDate> for DateInput {
    fn from(d: NaiveDate) -> Self {
        DateInput::Day(d)
    }
}

impl From<&str> for DateInput {
    fn from(s: &str) -> Self {
        DateInput::Iso(s.to_string())
    }
}

impl From<String> for DateInput {
    fn from(s: String) -> Self {
        DateInput::Iso(s)
    }
}

impl From<StoreTimestamp> for DateInput {
    fn from(ts: StoreTimestamp) -> Self {
        DateInput::Timestamp(ts)
    }
}

fn parse_iso_day(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let prefix = s.get(..10)?;
    let day = NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()?;
    let rest = &s[10..];
    if rest.is_empty() {
        return Some(day);
    }
    if !rest.starts_with(['T', ' ']) {
        return None;
    }
    // Offset-bearing strings are instants; the key uses their UTC day.
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|dt| dt.date())
}

/// `"YYYY-MM-DD"`, or the empty string when the input is unparseable.
///
/// Callers must treat the empty string as "exclude", never as a key.
pub fn normalize_date(input: &DateInput) -> String {
    input
        .to_day()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// `"{date}-{time}"` reserved key; empty if either half is empty.
pub fn generate_slot_key(date: &DateInput, time: &str) -> String {
    let day = normalize_date(date);
    let time = time.trim();
    if day.is_empty() || time.is_empty() {
        return String::new();
    }
    format!("{day}-{time}")
}

/// Serde helper: accept any [`DateInput`] shape for a calendar-day field.
pub fn deserialize_day<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
    let value = Value::deserialize(deserializer)?;
    DateInput::from_json(&value)
        .and_then(|d| d.to_day())
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised date: {value}")))
}

/// Serde helper: accept RFC 3339 strings, store timestamps, or epoch millis.
pub fn deserialize_instant<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let instant = match DateInput::from_json(&value) {
        Some(DateInput::Instant(dt)) => Some(dt),
        Some(DateInput::Timestamp(ts)) => ts.to_date(),
        Some(DateInput::Iso(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        Some(DateInput::Day(d)) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
        None => None,
    };
    instant.ok_or_else(|| serde::de::Error::custom(format!("unrecognised instant: {value}")))
}
