use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Humidity points kept per sensor for the live chart.
pub const CHART_POINTS: usize = 12;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub chart: HashMap<String, VecDeque<HumidityPoint>>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HumidityPoint {
    pub ts: i64,
    pub humidity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    History,
    Relay,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            chart: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a telemetry reading and append it to the sensor's chart.
    pub fn record_reading(&mut self, sensor_id: &str, humidity: f64, ts: i64) {
        let points = self.chart.entry(sensor_id.to_string()).or_default();
        if points.len() >= CHART_POINTS {
            points.pop_front();
        }
        points.push_back(HumidityPoint { ts, humidity });

        self.push_event(EventKind::Reading, format!("{sensor_id}: humedad={humidity}"));
    }

    /// Record a relay switch reported to the history log.
    pub fn record_history(&mut self, sensor_id: &str, accion: &str) {
        self.push_event(EventKind::History, format!("{sensor_id}: {accion}"));
    }

    /// Record a relay command issued by the hub.
    pub fn record_relay(&mut self, sensor_id: &str, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Relay, format!("{sensor_id} set {state_str}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Newest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    /// Chart points per sensor, oldest first, sensors in id order.
    pub fn chart_snapshot(&self) -> BTreeMap<String, Vec<HumidityPoint>> {
        self.chart
            .iter()
            .map(|(id, points)| (id.clone(), points.iter().cloned().collect()))
            .collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ring_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("tick {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);

        let recent = st.recent_events();
        assert_eq!(recent[0].detail, format!("tick {}", MAX_EVENTS + 24));
        assert_eq!(recent[MAX_EVENTS - 1].detail, "tick 25");
    }

    #[test]
    fn chart_keeps_last_points_per_sensor() {
        let mut st = SystemState::new();
        for i in 0..20 {
            st.record_reading("sensor1", i as f64, 1_000 + i);
        }
        st.record_reading("sensor2", 55.5, 2_000);

        let chart = st.chart_snapshot();
        let s1 = &chart["sensor1"];
        assert_eq!(s1.len(), CHART_POINTS);
        assert_eq!(s1[0].ts, 1_008);
        assert_eq!(s1[CHART_POINTS - 1].humidity, 19.0);
        assert_eq!(chart["sensor2"], vec![HumidityPoint { ts: 2_000, humidity: 55.5 }]);
    }

    #[test]
    fn event_kinds_recorded() {
        let mut st = SystemState::new();
        st.record_history("sensor1", "Riego ON");
        st.record_relay("sensor1", false);
        st.record_error("boom".into());

        let kinds: Vec<EventKind> = st.recent_events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Error, EventKind::Relay, EventKind::History]);
        assert_eq!(st.recent_events()[1].detail, "sensor1 set OFF");
    }

    #[test]
    fn event_serializes_rfc3339_timestamp() {
        let mut st = SystemState::new();
        st.record_system("hub started".into());
        let json = serde_json::to_value(&st.recent_events()[0]).unwrap();
        assert_eq!(json["kind"], "system");
        assert!(json["ts"].as_str().unwrap().contains('T'));
    }
}
