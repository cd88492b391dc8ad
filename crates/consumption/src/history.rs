//! History browsing: time-range filters over the raw event log and the
//! summary counts shown above the report table.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime, Time, UtcOffset};

use crate::event::{Action, Event};

/// Sensor id used by bench devices; left out of per-sensor counts.
pub const TEST_SENSOR_ID: &str = "sensor_test";

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("custom range needs both `from` and `to`")]
    MissingBounds,

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    BadDate(String),

    #[error("range start {from} is after end {to}")]
    Inverted { from: Date, to: Date },
}

// ---------------------------------------------------------------------------
// TimeRange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    /// Last 24 hours.
    Day,
    /// Last 7 days.
    Week,
    /// Last 30 days.
    Month,
    /// Last 365 days.
    Year,
    All,
    /// Whole calendar days, both ends inclusive.
    Custom { from: Date, to: Date },
}

impl TimeRange {
    /// Parse query parameters. Unknown or missing names mean [`TimeRange::All`];
    /// `custom` requires both dates as `YYYY-MM-DD`.
    pub fn parse(name: Option<&str>, from: Option<&str>, to: Option<&str>) -> Result<Self, RangeError> {
        let name = name.map(|s| s.trim().to_lowercase()).unwrap_or_default();
        Ok(match name.as_str() {
            "day" | "dia" | "día" => Self::Day,
            "week" | "semana" => Self::Week,
            "month" | "mes" => Self::Month,
            "year" | "año" | "ano" => Self::Year,
            "custom" | "personalizado" => {
                let (Some(from), Some(to)) = (from, to) else {
                    return Err(RangeError::MissingBounds);
                };
                let from = parse_date(from)?;
                let to = parse_date(to)?;
                if from > to {
                    return Err(RangeError::Inverted { from, to });
                }
                Self::Custom { from, to }
            }
            _ => Self::All,
        })
    }

    /// Inclusive epoch-second bounds. The rolling ranges have no upper bound.
    pub fn bounds(&self, now: OffsetDateTime, offset: UtcOffset) -> (i64, Option<i64>) {
        let now_ts = now.unix_timestamp();
        match *self {
            Self::Day => (now_ts - SECS_PER_DAY, None),
            Self::Week => (now_ts - 7 * SECS_PER_DAY, None),
            Self::Month => (now_ts - 30 * SECS_PER_DAY, None),
            Self::Year => (now_ts - 365 * SECS_PER_DAY, None),
            Self::All => (i64::MIN, None),
            Self::Custom { from, to } => {
                let start = from.with_time(Time::MIDNIGHT).assume_offset(offset);
                let end = to.with_time(Time::MIDNIGHT).assume_offset(offset);
                (
                    start.unix_timestamp(),
                    Some(end.unix_timestamp() + SECS_PER_DAY - 1),
                )
            }
        }
    }

    pub fn contains(&self, ts: i64, now: OffsetDateTime, offset: UtcOffset) -> bool {
        let (lo, hi) = self.bounds(now, offset);
        ts >= lo && hi.map_or(true, |hi| ts <= hi)
    }
}

fn parse_date(s: &str) -> Result<Date, RangeError> {
    Date::parse(s.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| RangeError::BadDate(s.to_string()))
}

/// Events inside `range`, newest first.
pub fn filter_history(
    events: &[Event],
    range: TimeRange,
    now: OffsetDateTime,
    offset: UtcOffset,
) -> Vec<Event> {
    let mut out: Vec<Event> = events
        .iter()
        .filter(|e| range.contains(e.timestamp, now, offset))
        .cloned()
        .collect();
    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    out
}

// ---------------------------------------------------------------------------
// HistoryStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    #[serde(rename = "totalEventos")]
    pub total_events: usize,
    #[serde(rename = "riegosON")]
    pub on_events: usize,
    #[serde(rename = "riegosOFF")]
    pub off_events: usize,
    #[serde(rename = "porSensor")]
    pub by_sensor: BTreeMap<String, usize>,
}

impl HistoryStats {
    pub fn from_events(events: &[Event]) -> Self {
        let mut stats = Self {
            total_events: events.len(),
            ..Self::default()
        };
        for e in events {
            match e.action() {
                Some(Action::On) => stats.on_events += 1,
                Some(Action::Off) => stats.off_events += 1,
                None => {}
            }
            if e.sensor != TEST_SENSOR_ID {
                *stats.by_sensor.entry(e.sensor.clone()).or_default() += 1;
            }
        }
        stats
    }
}

// ===========================================================================
// Tests
// ===========================================================================
