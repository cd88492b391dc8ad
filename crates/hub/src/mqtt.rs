use anyhow::{Context, Result};
use consumption::{Event, RawEvent};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::db::{Db, RELAY_OFF, RELAY_ON};
use crate::state::SharedState;

pub const READING_FILTER: &str = "tele/+/reading";
pub const HISTORY_FILTER: &str = "historial/+/event";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) humedad: f64,
    #[serde(default)]
    pub(crate) rele_estado: Option<i64>,
    #[serde(default)]
    pub(crate) ts: Option<i64>,
}

/// A history record published by a field device. The sensor id comes from the
/// topic, so a `sensor` key in the payload is ignored.
#[derive(Debug, Deserialize)]
pub(crate) struct EventMsg {
    #[serde(flatten)]
    pub(crate) raw: RawEvent,
    #[serde(default)]
    pub(crate) humedad: Option<f64>,
}

/// What an inbound publish turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Reading { sensor_id: String, known: bool },
    History(Event),
    Ignored,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

fn segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract sensor_id from "tele/<sensor_id>/reading".
pub(crate) fn extract_reading_sensor(topic: &str) -> Option<&str> {
    segment(topic, "tele", "reading")
}

/// Extract sensor_id from "historial/<sensor_id>/event".
pub(crate) fn extract_event_sensor(topic: &str) -> Option<&str> {
    segment(topic, "historial", "event")
}

pub fn relay_topic(sensor_id: &str) -> String {
    format!("rele/{sensor_id}/set")
}

/// Relay boards are active-low, so "irrigate" is "0".
pub fn relay_payload(on: bool) -> &'static str {
    if on {
        "0"
    } else {
        "1"
    }
}

fn relay_state_valid(state: i64) -> bool {
    state == RELAY_ON || state == RELAY_OFF
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Handle one inbound publish: persist it and mirror it into the live state.
/// Payload problems are recorded as system errors and returned.
pub async fn handle_publish(
    topic: &str,
    payload: &[u8],
    db: &Db,
    shared: &SharedState,
    now: OffsetDateTime,
) -> Result<Ingested> {
    let outcome = if let Some(sensor_id) = extract_reading_sensor(topic) {
        ingest_reading(sensor_id, payload, db, shared, now).await
    } else if let Some(sensor_id) = extract_event_sensor(topic) {
        ingest_event(sensor_id, payload, db, shared).await
    } else {
        tracing::debug!(topic, "unhandled topic");
        Ok(Ingested::Ignored)
    };

    if let Err(e) = &outcome {
        shared.write().await.record_error(format!("{topic}: {e:#}"));
    }
    outcome
}

async fn ingest_reading(
    sensor_id: &str,
    payload: &[u8],
    db: &Db,
    shared: &SharedState,
    now: OffsetDateTime,
) -> Result<Ingested> {
    let msg: ReadingMsg = serde_json::from_slice(payload).context("bad telemetry json")?;
    let relay_state = msg.rele_estado.filter(|s| {
        let ok = relay_state_valid(*s);
        if !ok {
            tracing::warn!(sensor = sensor_id, rele_estado = s, "ignoring unknown relay state");
        }
        ok
    });
    let ts = msg.ts.unwrap_or_else(|| now.unix_timestamp());

    let known = db
        .record_reading(sensor_id, msg.humedad, relay_state, ts)
        .await?;
    if known {
        tracing::debug!(sensor = sensor_id, humidity = msg.humedad, ts, "telemetry");
    } else {
        tracing::warn!(sensor = sensor_id, "unknown sensor, reading not stored");
    }

    shared
        .write()
        .await
        .record_reading(sensor_id, msg.humedad, ts);

    Ok(Ingested::Reading {
        sensor_id: sensor_id.to_string(),
        known,
    })
}

async fn ingest_event(
    sensor_id: &str,
    payload: &[u8],
    db: &Db,
    shared: &SharedState,
) -> Result<Ingested> {
    let mut msg: EventMsg = serde_json::from_slice(payload).context("bad history json")?;
    msg.raw.sensor = Some(sensor_id.to_string());
    let event = Event::try_from(msg.raw).context("invalid history record")?;

    db.insert_event(&event, msg.humedad).await?;
    tracing::info!(
        sensor = %event.sensor,
        accion = %event.accion,
        ts = event.timestamp,
        "history event stored"
    );

    shared
        .write()
        .await
        .record_history(&event.sensor, &event.accion);

    Ok(Ingested::History(event))
}

// ===========================================================================
// Tests
// ===========================================================================
