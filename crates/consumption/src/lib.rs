//! Water-consumption accounting for the irrigation history log.
//!
//! Field devices append `{sensor, accion, timestamp, fecha}` records whenever
//! a relay switches. This crate pairs ON/OFF records into watering periods,
//! converts their durations into litres at a fixed pump flow rate, and rolls
//! them up per day and per sensor. Everything here is pure: callers fetch a
//! snapshot of the log and hand it in; nothing is cached between calls.

pub mod event;
pub mod export;
pub mod history;
pub mod period;
pub mod rollup;

pub use event::{Action, Event, EventLog, RawEvent, RecordError};
pub use history::{filter_history, HistoryStats, RangeError, TimeRange};
pub use period::{round2, ConsumptionAggregator, WateringPeriod, FLOW_RATE_L_PER_MIN};
pub use rollup::{ConsumptionTotal, DailyConsumption, SensorConsumption, TodayConsumption};
