//! Spreadsheet-friendly CSV export of the history table and of the computed
//! watering periods. Column names match the JSON field names.

use std::io::Write;

use serde::Serialize;
use thiserror::Error;

use crate::event::Event;
use crate::period::WateringPeriod;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

const HISTORY_HEADER: [&str; 5] = ["fecha", "sensor", "planta", "accion", "timestamp"];

const PERIOD_HEADER: [&str; 10] = [
    "sensor",
    "planta",
    "fechaInicio",
    "fechaFin",
    "timestampInicio",
    "timestampFin",
    "duracionSegundos",
    "duracionMinutos",
    "consumoLitros",
    "accionFin",
];

#[derive(Serialize)]
struct HistoryRow<'a> {
    fecha: &'a str,
    sensor: &'a str,
    planta: String,
    accion: &'a str,
    timestamp: i64,
}

#[derive(Serialize)]
struct PeriodRow<'a> {
    sensor: &'a str,
    planta: String,
    fecha_inicio: &'a str,
    fecha_fin: &'a str,
    timestamp_inicio: i64,
    timestamp_fin: i64,
    duracion_segundos: i64,
    duracion_minutos: f64,
    consumo_litros: f64,
    accion_fin: &'a str,
}

fn writer<W: Write>(out: W, header: &[&str]) -> Result<csv::Writer<W>, ExportError> {
    // Header written by hand so an empty export still has one.
    let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    w.write_record(header)?;
    Ok(w)
}

/// Write history rows. `name_of` maps a sensor id to its display name
/// (usually the assigned plant).
pub fn write_history_csv<W, F>(out: W, events: &[Event], name_of: F) -> Result<(), ExportError>
where
    W: Write,
    F: Fn(&str) -> String,
{
    let mut w = writer(out, &HISTORY_HEADER)?;
    for e in events {
        w.serialize(HistoryRow {
            fecha: &e.fecha,
            sensor: &e.sensor,
            planta: name_of(&e.sensor),
            accion: &e.accion,
            timestamp: e.timestamp,
        })?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_periods_csv<W, F>(
    out: W,
    periods: &[WateringPeriod],
    name_of: F,
) -> Result<(), ExportError>
where
    W: Write,
    F: Fn(&str) -> String,
{
    let mut w = writer(out, &PERIOD_HEADER)?;
    for p in periods {
        w.serialize(PeriodRow {
            sensor: &p.sensor,
            planta: name_of(&p.sensor),
            fecha_inicio: &p.start_fecha,
            fecha_fin: &p.end_fecha,
            timestamp_inicio: p.start_ts,
            timestamp_fin: p.end_ts,
            duracion_segundos: p.duration_secs,
            duracion_minutos: p.duration_min,
            consumo_litros: p.liters,
            accion_fin: &p.end_action,
        })?;
    }
    w.flush()?;
    Ok(())
}

pub fn history_csv<F: Fn(&str) -> String>(events: &[Event], name_of: F) -> Result<String, ExportError> {
    let mut buf = Vec::new();
    write_history_csv(&mut buf, events, name_of)?;
    Ok(String::from_utf8(buf)?)
}

pub fn periods_csv<F: Fn(&str) -> String>(
    periods: &[WateringPeriod],
    name_of: F,
) -> Result<String, ExportError> {
    let mut buf = Vec::new();
    write_periods_csv(&mut buf, periods, name_of)?;
    Ok(String::from_utf8(buf)?)
}

// ===========================================================================
// Tests
// ===========================================================================
