//! ON/OFF pairing: turns a flat history log into watering periods.
//!
//! Events are sorted by timestamp (stable, so equal timestamps keep their
//! input order) and walked once. Each sensor has at most one pending ON:
//!
//! ```text
//! ON  ──▶ pending[sensor] = this ON        (overwrites an earlier ON)
//! OFF ──▶ pending[sensor]? emit period, clear : drop the OFF
//! ```
//!
//! An ON still pending at the end of the log is an open session, not
//! consumption, and is never reported.

use std::collections::HashMap;

use serde::Serialize;
use time::UtcOffset;
use tracing::warn;

use crate::event::{Action, Event};

/// Assumed pump flow. Not measured.
pub const FLOW_RATE_L_PER_MIN: f64 = 1.67;

/// A matched ON→OFF pair for one sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringPeriod {
    pub sensor: String,
    #[serde(rename = "fechaInicio")]
    pub start_fecha: String,
    #[serde(rename = "fechaFin")]
    pub end_fecha: String,
    #[serde(rename = "timestampInicio")]
    pub start_ts: i64,
    #[serde(rename = "timestampFin")]
    pub end_ts: i64,
    #[serde(rename = "duracionSegundos")]
    pub duration_secs: i64,
    /// Rounded to 2 decimals.
    #[serde(rename = "duracionMinutos")]
    pub duration_min: f64,
    /// Rounded to 2 decimals; derived from the unrounded minutes.
    #[serde(rename = "consumoLitros")]
    pub liters: f64,
    #[serde(rename = "accionInicio")]
    pub start_action: String,
    #[serde(rename = "accionFin")]
    pub end_action: String,
}

/// Round half away from zero to 2 decimal places.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

struct PendingOpen<'a> {
    timestamp: i64,
    fecha: &'a str,
    accion: &'a str,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Stateless consumption calculator. Every call recomputes from the snapshot
/// it is given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumptionAggregator {
    flow_rate_l_per_min: f64,
    offset: UtcOffset,
}

impl Default for ConsumptionAggregator {
    fn default() -> Self {
        Self::new(FLOW_RATE_L_PER_MIN, UtcOffset::UTC)
    }
}

impl ConsumptionAggregator {
    /// `offset` sets where calendar days begin for the daily rollups.
    pub fn new(flow_rate_l_per_min: f64, offset: UtcOffset) -> Self {
        Self {
            flow_rate_l_per_min,
            offset,
        }
    }

    pub fn flow_rate(&self) -> f64 {
        self.flow_rate_l_per_min
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Pair ON/OFF events into watering periods, in the order their closing
    /// OFF occurs. Unmatched and unclassified events are dropped.
    pub fn periods(&self, events: &[Event]) -> Vec<WateringPeriod> {
        let mut sorted: Vec<&Event> = events.iter().collect();
        sorted.sort_by_key(|e| e.timestamp);

        let mut pending: HashMap<&str, PendingOpen<'_>> = HashMap::new();
        let mut periods = Vec::new();

        for event in sorted {
            match event.action() {
                Some(Action::On) => {
                    pending.insert(
                        event.sensor.as_str(),
                        PendingOpen {
                            timestamp: event.timestamp,
                            fecha: &event.fecha,
                            accion: &event.accion,
                        },
                    );
                }
                Some(Action::Off) => {
                    if let Some(open) = pending.remove(event.sensor.as_str()) {
                        periods.extend(self.close(open, event));
                    }
                }
                None => {}
            }
        }

        periods
    }

    /// `None` when the span does not fit in an `i64` of seconds.
    fn close(&self, open: PendingOpen<'_>, off: &Event) -> Option<WateringPeriod> {
        let Some(duration_secs) = off.timestamp.checked_sub(open.timestamp) else {
            warn!(
                sensor = %off.sensor,
                start_ts = open.timestamp,
                end_ts = off.timestamp,
                "watering period span overflows, dropping pair"
            );
            return None;
        };
        let minutes = duration_secs as f64 / 60.0;

        Some(WateringPeriod {
            sensor: off.sensor.clone(),
            start_fecha: open.fecha.to_string(),
            end_fecha: off.fecha.clone(),
            start_ts: open.timestamp,
            end_ts: off.timestamp,
            duration_secs,
            duration_min: round2(minutes),
            liters: round2(minutes * self.flow_rate_l_per_min),
            start_action: open.accion.to_string(),
            end_action: off.accion.clone(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(sensor: &str, accion: &str, ts: i64) -> Event {
        Event::new(sensor, accion, ts)
    }

    fn periods(events: &[Event]) -> Vec<WateringPeriod> {
        ConsumptionAggregator::default().periods(events)
    }

    // -- round2 -------------------------------------------------------------

    #[test]
    fn round2_half_away_from_zero() {
        assert_eq!(round2(0.835), 0.84);
        assert_eq!(round2(4.175), 4.18);
        assert_eq!(round2(2.783_333), 2.78);
        assert_eq!(round2(0.0), 0.0);
    }

    // -- Pairing ------------------------------------------------------------

    #[test]
    fn single_pair_one_minute() {
        let p = periods(&[ev("sensor1", "ON", 10), ev("sensor1", "OFF", 70)]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].duration_secs, 60);
        assert_eq!(p[0].duration_min, 1.0);
        assert_eq!(p[0].liters, 1.67);
        assert_eq!(p[0].start_ts, 10);
        assert_eq!(p[0].end_ts, 70);
    }

    #[test]
    fn second_on_overwrites_pending() {
        // The ON at 10 is discarded without ever producing a period.
        let p = periods(&[
            ev("sensor1", "ON", 10),
            ev("sensor1", "ON", 20),
            ev("sensor1", "OFF", 80),
        ]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].start_ts, 20);
        assert_eq!(p[0].end_ts, 80);
        assert_eq!(p[0].duration_secs, 60);
    }

    #[test]
    fn interleaved_sensors_pair_independently() {
        let p = periods(&[
            ev("sensor1", "ON", 10),
            ev("sensor2", "ON", 15),
            ev("sensor1", "OFF", 70),
            ev("sensor2", "OFF", 95),
        ]);
        assert_eq!(p.len(), 2);
        assert_eq!(p[0].sensor, "sensor1");
        assert_eq!((p[0].start_ts, p[0].end_ts), (10, 70));
        assert_eq!(p[1].sensor, "sensor2");
        assert_eq!((p[1].start_ts, p[1].end_ts), (15, 95));
    }

    #[test]
    fn off_never_closes_another_sensors_on() {
        let p = periods(&[ev("sensor1", "ON", 10), ev("sensor2", "OFF", 70)]);
        assert!(p.is_empty());
    }

    #[test]
    fn trailing_on_is_not_reported() {
        let p = periods(&[
            ev("sensor1", "ON", 10),
            ev("sensor1", "OFF", 70),
            ev("sensor1", "ON", 1000),
        ]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].end_ts, 70);
    }

    #[test]
    fn unmatched_off_is_dropped() {
        let p = periods(&[
            ev("sensor1", "OFF", 5),
            ev("sensor1", "ON", 10),
            ev("sensor1", "OFF", 70),
            ev("sensor1", "OFF", 90),
        ]);
        assert_eq!(p.len(), 1);
        assert_eq!((p[0].start_ts, p[0].end_ts), (10, 70));
    }

    #[test]
    fn unclassified_actions_are_ignored() {
        let p = periods(&[
            ev("sensor1", "ON", 10),
            ev("sensor1", "Humedad registrada", 40),
            ev("sensor1", "OFF", 70),
        ]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].duration_secs, 60);
    }

    #[test]
    fn unsorted_input_is_sorted_before_pairing() {
        let p = periods(&[ev("sensor1", "OFF", 70), ev("sensor1", "ON", 10)]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].duration_secs, 60);
    }

    #[test]
    fn equal_timestamps_keep_input_order() {
        let zero = periods(&[ev("sensor1", "ON", 10), ev("sensor1", "OFF", 10)]);
        assert_eq!(zero.len(), 1);
        assert_eq!(zero[0].duration_secs, 0);
        assert_eq!(zero[0].liters, 0.0);

        // OFF first: dropped, then ON stays pending.
        let none = periods(&[ev("sensor1", "OFF", 10), ev("sensor1", "ON", 10)]);
        assert!(none.is_empty());
    }

    #[test]
    fn periods_ordered_by_closing_off() {
        let p = periods(&[
            ev("sensor1", "ON", 0),
            ev("sensor2", "ON", 10),
            ev("sensor2", "OFF", 20),
            ev("sensor1", "OFF", 30),
        ]);
        assert_eq!(p[0].sensor, "sensor2");
        assert_eq!(p[1].sensor, "sensor1");
    }

    #[test]
    fn labels_and_fecha_carried_through() {
        let p = periods(&[
            ev("sensor1", "Riego automático ON", 10).with_fecha("01/03/2024 08:00:10"),
            ev("sensor1", "Riego automático OFF", 70).with_fecha("01/03/2024 08:01:10"),
        ]);
        assert_eq!(p[0].start_fecha, "01/03/2024 08:00:10");
        assert_eq!(p[0].end_fecha, "01/03/2024 08:01:10");
        assert_eq!(p[0].start_action, "Riego automático ON");
        assert_eq!(p[0].end_action, "Riego automático OFF");
    }

    #[test]
    fn liters_use_unrounded_minutes() {
        // 100 s = 1.666.. min; 1.666.. * 1.67 = 2.783.. -> 2.78 (not 1.67 * 1.67).
        let p = periods(&[ev("sensor1", "ON", 1000), ev("sensor1", "OFF", 1100)]);
        assert_eq!(p[0].duration_min, 1.67);
        assert_eq!(p[0].liters, 2.78);
    }

    #[test]
    fn custom_flow_rate() {
        let agg = ConsumptionAggregator::new(2.0, UtcOffset::UTC);
        let p = agg.periods(&[ev("s", "ON", 0), ev("s", "OFF", 90)]);
        assert_eq!(p[0].liters, 3.0);
    }

    #[test]
    fn empty_log_yields_nothing() {
        assert!(periods(&[]).is_empty());
    }

    #[test]
    fn overflowing_span_is_dropped() {
        let events = vec![
            ev("sensor1", "ON", -5_000_000_000_000_000_000),
            ev("sensor1", "OFF", 5_000_000_000_000_000_000),
            ev("sensor2", "ON", 10),
            ev("sensor2", "OFF", 70),
        ];
        let out = periods(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sensor, "sensor2");
        assert!(out.iter().all(|p| p.duration_secs >= 0 && p.liters >= 0.0));
    }

    #[test]
    fn input_slice_is_untouched() {
        let events = vec![ev("sensor1", "OFF", 70), ev("sensor1", "ON", 10)];
        let before = events.clone();
        let _ = periods(&events);
        assert_eq!(events, before);
    }

    #[test]
    fn period_serializes_with_wire_names() {
        let p = periods(&[ev("sensor1", "ON", 10), ev("sensor1", "OFF", 70)]);
        let json = serde_json::to_value(&p[0]).unwrap();
        assert_eq!(json["timestampInicio"], 10);
        assert_eq!(json["timestampFin"], 70);
        assert_eq!(json["duracionSegundos"], 60);
        assert_eq!(json["consumoLitros"], 1.67);
        assert_eq!(json["fechaInicio"], "");
    }
}
