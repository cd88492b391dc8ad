//! Irrigation history records: the loose shape they arrive in, the validated
//! [`Event`] the aggregator works on, and ON/OFF classification of the
//! free-text action label.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a history record was rejected at the parsing boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("sensor id is empty")]
    EmptySensor,

    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Action classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
}

impl Action {
    /// Classify a free-text label by case-insensitive substring match.
    /// `"on"` is tested first, so a label containing both reads as ON.
    pub fn classify(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if lower.contains("on") {
            Some(Self::On)
        } else if lower.contains("off") {
            Some(Self::Off)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Validated event
// ---------------------------------------------------------------------------

/// One entry of the irrigation history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sensor: String,
    pub accion: String,
    /// Unix epoch seconds.
    pub timestamp: i64,
    /// Human-readable timestamp, carried through untouched.
    #[serde(default)]
    pub fecha: String,
}

impl Event {
    pub fn new(sensor: impl Into<String>, accion: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sensor: sensor.into(),
            accion: accion.into(),
            timestamp,
            fecha: String::new(),
        }
    }

    pub fn with_fecha(mut self, fecha: impl Into<String>) -> Self {
        self.fecha = fecha.into();
        self
    }

    pub fn action(&self) -> Option<Action> {
        Action::classify(&self.accion)
    }
}

// ---------------------------------------------------------------------------
// Loose wire shape
// ---------------------------------------------------------------------------

/// A history record as stored by field devices. Every field is optional and
/// `timestamp` may be a number or a string; [`Event::try_from`] enforces the
/// real shape.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub sensor: Option<String>,
    #[serde(default)]
    pub accion: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub fecha: Option<String>,
}

impl TryFrom<RawEvent> for Event {
    type Error = RecordError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let sensor = raw.sensor.ok_or(RecordError::MissingField("sensor"))?;
        if sensor.trim().is_empty() {
            return Err(RecordError::EmptySensor);
        }
        let accion = raw.accion.ok_or(RecordError::MissingField("accion"))?;
        let timestamp = raw
            .timestamp
            .as_ref()
            .ok_or(RecordError::MissingField("timestamp"))
            .and_then(parse_timestamp)?;

        Ok(Self {
            sensor,
            accion,
            timestamp,
            fecha: raw.fecha.unwrap_or_default(),
        })
    }
}

/// Accepts integers, integral floats, and decimal strings.
pub fn parse_timestamp(value: &Value) -> Result<i64, RecordError> {
    let bad = || RecordError::BadTimestamp(value.to_string());
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(bad()),
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| bad()),
        _ => Err(bad()),
    }
}

// ---------------------------------------------------------------------------
// Snapshot parsing
// ---------------------------------------------------------------------------

/// An immutable snapshot of the history log, built from whatever the store
/// returned. Invalid records are logged and left out.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
    rejected: usize,
}

impl EventLog {
    /// Parse a JSON snapshot: either an array of records or an object keyed
    /// by record id. `null` is an empty log.
    pub fn from_json(value: &Value) -> Self {
        let mut log = Self::default();
        match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    log.push_value(&i.to_string(), item);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    log.push_value(key, item);
                }
            }
            Value::Null => {}
            other => {
                warn!(kind = json_kind(other), "history snapshot is not a collection");
            }
        }
        log
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Number of records dropped during parsing.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    fn push_value(&mut self, key: &str, item: &Value) {
        let parsed = serde_json::from_value::<RawEvent>(item.clone())
            .map_err(|e| RecordError::Malformed(e.to_string()))
            .and_then(Event::try_from);

        match parsed {
            Ok(event) => self.events.push(event),
            Err(e) => {
                warn!(record = %key, error = %e, "skipping history record");
                self.rejected += 1;
            }
        }
    }
}

impl From<Vec<Event>> for EventLog {
    fn from(events: Vec<Event>) -> Self {
        Self {
            events,
            rejected: 0,
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- Action::classify ---------------------------------------------------

    #[test]
    fn classify_on_labels() {
        assert_eq!(Action::classify("ON"), Some(Action::On));
        assert_eq!(Action::classify("Riego automático ON"), Some(Action::On));
        assert_eq!(Action::classify("riego manual on"), Some(Action::On));
    }

    #[test]
    fn classify_off_labels() {
        assert_eq!(Action::classify("OFF"), Some(Action::Off));
        assert_eq!(Action::classify("Riego automático OFF"), Some(Action::Off));
        assert_eq!(Action::classify("Bomba oFf"), Some(Action::Off));
    }

    #[test]
    fn classify_is_substring_not_token() {
        // "bONus" contains "on" even though it is not the word ON.
        assert_eq!(Action::classify("bonus"), Some(Action::On));
    }

    #[test]
    fn classify_neither() {
        assert_eq!(Action::classify("Humedad registrada"), None);
        assert_eq!(Action::classify(""), None);
    }

    // -- RawEvent -> Event --------------------------------------------------

    fn raw(v: Value) -> RawEvent {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn valid_record_converts() {
        let e = Event::try_from(raw(json!({
            "sensor": "sensor1",
            "accion": "Riego ON",
            "timestamp": 1_700_000_000,
            "fecha": "14/11/2023 22:13:20"
        })))
        .unwrap();
        assert_eq!(e.sensor, "sensor1");
        assert_eq!(e.timestamp, 1_700_000_000);
        assert_eq!(e.fecha, "14/11/2023 22:13:20");
        assert_eq!(e.action(), Some(Action::On));
    }

    #[test]
    fn missing_fecha_defaults_to_empty() {
        let e = Event::try_from(raw(json!({
            "sensor": "sensor1", "accion": "OFF", "timestamp": 5
        })))
        .unwrap();
        assert_eq!(e.fecha, "");
    }

    #[test]
    fn missing_sensor_rejected() {
        let err = Event::try_from(raw(json!({"accion": "ON", "timestamp": 1}))).unwrap_err();
        assert_eq!(err, RecordError::MissingField("sensor"));
    }

    #[test]
    fn blank_sensor_rejected() {
        let err = Event::try_from(raw(json!({"sensor": "  ", "accion": "ON", "timestamp": 1})))
            .unwrap_err();
        assert_eq!(err, RecordError::EmptySensor);
    }

    #[test]
    fn missing_accion_rejected() {
        let err = Event::try_from(raw(json!({"sensor": "s", "timestamp": 1}))).unwrap_err();
        assert_eq!(err, RecordError::MissingField("accion"));
    }

    #[test]
    fn missing_timestamp_rejected() {
        let err = Event::try_from(raw(json!({"sensor": "s", "accion": "ON"}))).unwrap_err();
        assert_eq!(err, RecordError::MissingField("timestamp"));
    }

    // -- parse_timestamp ----------------------------------------------------

    #[test]
    fn timestamp_integer() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000)), Ok(1_700_000_000));
    }

    #[test]
    fn timestamp_integral_float() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000.0)), Ok(1_700_000_000));
    }

    #[test]
    fn timestamp_fractional_float_rejected() {
        assert!(parse_timestamp(&json!(12.5)).is_err());
    }

    #[test]
    fn timestamp_string() {
        assert_eq!(parse_timestamp(&json!(" 1700000000 ")), Ok(1_700_000_000));
    }

    #[test]
    fn timestamp_garbage_rejected() {
        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert!(parse_timestamp(&json!(true)).is_err());
        assert!(parse_timestamp(&json!(null)).is_err());
    }

    // -- EventLog::from_json -------------------------------------------------

    #[test]
    fn log_from_array() {
        let log = EventLog::from_json(&json!([
            {"sensor": "sensor1", "accion": "ON", "timestamp": 10},
            {"sensor": "sensor1", "accion": "OFF", "timestamp": 70}
        ]));
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.rejected(), 0);
    }

    #[test]
    fn log_from_keyed_object() {
        let log = EventLog::from_json(&json!({
            "-Nabc1": {"sensor": "sensor1", "accion": "ON", "timestamp": 10},
            "-Nabc2": {"sensor": "sensor2", "accion": "OFF", "timestamp": 20}
        }));
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn log_skips_invalid_records() {
        let log = EventLog::from_json(&json!([
            {"sensor": "sensor1", "accion": "ON", "timestamp": 10},
            {"sensor": "sensor1", "accion": "OFF"},
            {"sensor": "sensor1", "accion": "OFF", "timestamp": "soon"},
            "not even an object",
            {"sensor": "sensor1", "accion": "OFF", "timestamp": "70"}
        ]));
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.rejected(), 3);
        assert_eq!(log.events()[1].timestamp, 70);
    }

    #[test]
    fn log_from_null_is_empty() {
        let log = EventLog::from_json(&Value::Null);
        assert!(log.events().is_empty());
        assert_eq!(log.rejected(), 0);
    }

    #[test]
    fn log_from_scalar_is_empty() {
        let log = EventLog::from_json(&json!(42));
        assert!(log.into_events().is_empty());
    }
}
