//! Ride events and the line parser.
//!
//! Wire format, one JSON object per line:
//! `{"trip_id":"t1","driver_id":23,"distance_km":12.3,"fare_amount":45.6,"timestamp":"2025-04-01 17:00:12"}`

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TabularRow;

/// Format used for timestamps on the wire and in CSV output.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single completed ride as emitted by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEvent {
    pub trip_id: String,
    pub driver_id: i64,
    pub distance_km: f64,
    pub fare_amount: f64,
    #[serde(rename = "timestamp", with = "wire_time")]
    pub event_time: DateTime<Utc>,
}

impl RideEvent {
    /// Encode back into the wire representation (no trailing newline).
    pub fn to_json_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl TabularRow for RideEvent {
    const HEADER: &'static [&'static str] =
        &["trip_id", "driver_id", "distance_km", "fare_amount", "timestamp"];

    fn to_record(&self) -> Vec<String> {
        vec![
            self.trip_id.clone(),
            self.driver_id.to_string(),
            self.distance_km.to_string(),
            self.fare_amount.to_string(),
            format_timestamp(&self.event_time),
        ]
    }
}

/// Why a raw line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("malformed json: {0}")]
    Json(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for field `{0}`")]
    InvalidField(&'static str),
}

impl ParseErrorKind {
    /// Short label used for the `reason` metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            ParseErrorKind::Json(_) => "json",
            ParseErrorKind::MissingField(_) => "missing_field",
            ParseErrorKind::InvalidField(_) => "invalid_field",
        }
    }
}

/// A line that could not be turned into a [`RideEvent`], tagged with the raw input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} (line: {line:?})")]
pub struct ParseError {
    pub line: String,
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(line: &str, kind: ParseErrorKind) -> Self {
        Self { line: line.to_string(), kind }
    }
}

/// Decode one raw line into a [`RideEvent`].
///
/// All five fields are required. `distance_km` and `fare_amount` must be finite and
/// non-negative, `driver_id` must be an integer and `timestamp` one of
/// `YYYY-MM-DD HH:MM:SS[.fff]` (read as UTC) or RFC 3339.
pub fn parse_event(line: &str) -> Result<RideEvent, ParseError> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| ParseError::new(line, ParseErrorKind::Json(e.to_string())))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::new(line, ParseErrorKind::Json("expected a json object".into())))?;

    let field = |name: &'static str| {
        obj.get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ParseError::new(line, ParseErrorKind::MissingField(name)))
    };
    let invalid = |name: &'static str| ParseError::new(line, ParseErrorKind::InvalidField(name));

    let trip_id = field("trip_id")?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("trip_id"))?
        .to_string();
    let driver_id = field("driver_id")?.as_i64().ok_or_else(|| invalid("driver_id"))?;
    let distance_km = non_negative(field("distance_km")?).ok_or_else(|| invalid("distance_km"))?;
    let fare_amount = non_negative(field("fare_amount")?).ok_or_else(|| invalid("fare_amount"))?;
    let event_time = field("timestamp")?
        .as_str()
        .and_then(parse_timestamp)
        .ok_or_else(|| invalid("timestamp"))?;

    Ok(RideEvent {
        trip_id,
        driver_id,
        distance_km,
        fare_amount,
        event_time,
    })
}

fn non_negative(v: &Value) -> Option<f64> {
    v.as_f64().filter(|x| x.is_finite() && *x >= 0.0)
}

/// Parse the timestamp forms accepted on the wire.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

mod wire_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        // sub-second precision survives a round trip; whole seconds print without a fraction
        s.collect_str(&ts.format("%Y-%m-%d %H:%M:%S%.f"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}
