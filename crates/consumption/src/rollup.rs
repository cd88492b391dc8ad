//! Consumption rollups over the period list: grand total, today, per day,
//! per sensor.
//!
//! Every rollup sums the already-rounded per-period litres and rounds the sum
//! again, so a table of periods always adds up to the total shown next to it.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use time::{Date, OffsetDateTime, Time};
use tracing::warn;

use crate::event::Event;
use crate::period::{round2, ConsumptionAggregator, WateringPeriod};

const SECS_PER_DAY: i64 = 86_400;

// ---------------------------------------------------------------------------
// Result shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionTotal {
    #[serde(rename = "periodos")]
    pub periods: Vec<WateringPeriod>,
    #[serde(rename = "consumoTotal")]
    pub total_liters: f64,
    #[serde(rename = "totalPeriodos")]
    pub period_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodayConsumption {
    #[serde(rename = "consumoLitros")]
    pub liters: f64,
    #[serde(rename = "totalRiegos")]
    pub period_count: usize,
    #[serde(rename = "periodos")]
    pub periods: Vec<WateringPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyConsumption {
    /// `YYYY-MM-DD` in the aggregator's offset.
    #[serde(rename = "fecha")]
    pub date: String,
    #[serde(rename = "consumoLitros")]
    pub liters: f64,
    #[serde(rename = "totalRiegos")]
    pub period_count: usize,
    #[serde(rename = "periodos")]
    pub periods: Vec<WateringPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorConsumption {
    pub sensor: String,
    #[serde(rename = "consumoLitros")]
    pub liters: f64,
    #[serde(rename = "totalRiegos")]
    pub period_count: usize,
    #[serde(rename = "duracionTotalMinutos")]
    pub total_minutes: f64,
}

/// Rounded sum of rounded per-period litres.
pub fn sum_liters<'a>(periods: impl IntoIterator<Item = &'a WateringPeriod>) -> f64 {
    round2(periods.into_iter().fold(0.0, |acc, p| acc + p.liters))
}

fn format_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

// ---------------------------------------------------------------------------
// Rollups
// ---------------------------------------------------------------------------

impl ConsumptionAggregator {
    /// All periods plus their total.
    pub fn total(&self, events: &[Event]) -> ConsumptionTotal {
        let periods = self.periods(events);
        ConsumptionTotal {
            total_liters: sum_liters(&periods),
            period_count: periods.len(),
            periods,
        }
    }

    /// Inclusive epoch-second bounds of the calendar day containing `now`,
    /// i.e. 00:00:00 through 23:59:59 in the aggregator's offset.
    pub fn day_window(&self, now: OffsetDateTime) -> (i64, i64) {
        let start = now
            .to_offset(self.offset())
            .replace_time(Time::MIDNIGHT)
            .unix_timestamp();
        (start, start + SECS_PER_DAY - 1)
    }

    /// Periods that started during the calendar day containing `now`.
    pub fn today(&self, events: &[Event], now: OffsetDateTime) -> TodayConsumption {
        let (start, end) = self.day_window(now);
        let periods: Vec<WateringPeriod> = self
            .periods(events)
            .into_iter()
            .filter(|p| (start..=end).contains(&p.start_ts))
            .collect();

        TodayConsumption {
            liters: sum_liters(&periods),
            period_count: periods.len(),
            periods,
        }
    }

    /// Periods grouped by the calendar date they started on, newest first.
    pub fn by_day(&self, events: &[Event]) -> Vec<DailyConsumption> {
        let mut days: BTreeMap<Date, Vec<WateringPeriod>> = BTreeMap::new();

        for period in self.periods(events) {
            let local = OffsetDateTime::from_unix_timestamp(period.start_ts)
                .ok()
                .and_then(|t| t.checked_to_offset(self.offset()));
            match local {
                Some(t) => days.entry(t.date()).or_default().push(period),
                None => {
                    warn!(
                        sensor = %period.sensor,
                        start_ts = period.start_ts,
                        "period start out of calendar range"
                    );
                }
            }
        }

        days.into_iter()
            .rev()
            .map(|(date, periods)| DailyConsumption {
                date: format_date(date),
                liters: sum_liters(&periods),
                period_count: periods.len(),
                periods,
            })
            .collect()
    }

    /// One entry per sensor that produced at least one period, in order of
    /// each sensor's first period.
    pub fn by_sensor(&self, events: &[Event]) -> Vec<SensorConsumption> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut out: Vec<SensorConsumption> = Vec::new();

        for p in self.periods(events) {
            let i = *index.entry(p.sensor.clone()).or_insert_with(|| {
                out.push(SensorConsumption {
                    sensor: p.sensor.clone(),
                    liters: 0.0,
                    period_count: 0,
                    total_minutes: 0.0,
                });
                out.len() - 1
            });
            let entry = &mut out[i];
            entry.liters += p.liters;
            entry.total_minutes += p.duration_min;
            entry.period_count += 1;
        }

        for entry in &mut out {
            entry.liters = round2(entry.liters);
            entry.total_minutes = round2(entry.total_minutes);
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
