//! TOML config file loading, validation, and database seeding for plants and
//! sensors, plus the hub-wide settings that shape consumption reports.

use anyhow::{bail, Context, Result};
use consumption::{ConsumptionAggregator, FLOW_RATE_L_PER_MIN};
use serde::Deserialize;
use std::collections::HashSet;
use time::macros::format_description;
use time::UtcOffset;

use crate::db::{Assignment, Db};
use crate::plants::{plant_id_for, PlantInput};

/// Default seconds without telemetry before a sensor counts as offline.
pub const DEFAULT_ONLINE_TIMEOUT_SEC: i64 = 15;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub plants: Vec<PlantInput>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// `"+HH:MM"` / `"-HH:MM"`; where calendar days start. UTC when absent.
    pub utc_offset: Option<String>,
    pub flow_rate_l_per_min: f64,
    pub online_timeout_sec: i64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            utc_offset: None,
            flow_rate_l_per_min: FLOW_RATE_L_PER_MIN,
            online_timeout_sec: DEFAULT_ONLINE_TIMEOUT_SEC,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub name: String,
    #[serde(default)]
    pub plant_id: Option<String>,
}

/// Resolved runtime settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub offset: UtcOffset,
    pub flow_rate_l_per_min: f64,
    pub online_timeout_sec: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            offset: UtcOffset::UTC,
            flow_rate_l_per_min: FLOW_RATE_L_PER_MIN,
            online_timeout_sec: DEFAULT_ONLINE_TIMEOUT_SEC,
        }
    }
}

impl Settings {
    pub fn aggregator(&self) -> ConsumptionAggregator {
        ConsumptionAggregator::new(self.flow_rate_l_per_min, self.offset)
    }
}

/// Accepts `"UTC"`, `"Z"`, or a signed `"±HH:MM"`.
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(
        s,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("invalid utc_offset '{s}', expected e.g. \"-05:00\""))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_plants(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Runtime settings; call after [`Config::validate`].
    pub fn settings(&self) -> Result<Settings> {
        let offset = match &self.hub.utc_offset {
            Some(s) => parse_utc_offset(s)?,
            None => UtcOffset::UTC,
        };
        Ok(Settings {
            offset,
            flow_rate_l_per_min: self.hub.flow_rate_l_per_min,
            online_timeout_sec: self.hub.online_timeout_sec,
        })
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let hub = &self.hub;
        if let Some(s) = &hub.utc_offset {
            if let Err(e) = parse_utc_offset(s) {
                errors.push(format!("hub: {e}"));
            }
        }
        if !hub.flow_rate_l_per_min.is_finite() || hub.flow_rate_l_per_min <= 0.0 {
            errors.push(format!(
                "hub: flow_rate_l_per_min must be positive, got {}",
                hub.flow_rate_l_per_min
            ));
        }
        if hub.online_timeout_sec <= 0 {
            errors.push(format!(
                "hub: online_timeout_sec must be positive, got {}",
                hub.online_timeout_sec
            ));
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<String> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = if p.name.trim().is_empty() {
                format!("plants[{i}]")
            } else {
                format!("plant '{}'", p.name)
            };

            if let Err(e) = p.validate() {
                for msg in e.0 {
                    errors.push(format!("{ctx}: {msg}"));
                }
            }

            let id = plant_id_for(&p.name);
            if !id.is_empty() && !seen_ids.insert(id.clone()) {
                errors.push(format!("{ctx}: duplicate plant id '{id}'"));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let plant_ids: HashSet<String> = self.plants.iter().map(|p| plant_id_for(&p.name)).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Plant reference ─────────────────────────────────
            if let Some(plant_id) = &s.plant_id {
                if !plant_ids.contains(plant_id) {
                    errors.push(format!(
                        "{}: plant_id '{plant_id}' does not match any defined plant",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all plants and sensors from the config into the database, then
/// apply any plant assignments.
pub async fn apply(config: &Config, db: &Db, settings: &Settings) -> Result<()> {
    let today = Db::today_yyyy_mm_dd(settings.offset);

    for p in &config.plants {
        let plant = p.clone().into_plant(plant_id_for(&p.name), today.clone());
        db.upsert_plant(&plant)
            .await
            .with_context(|| format!("failed to upsert plant '{}'", p.name))?;
    }

    for s in &config.sensors {
        db.upsert_sensor(&s.sensor_id, &s.name)
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;

        if let Some(plant_id) = &s.plant_id {
            match db.assign_plant(&s.sensor_id, plant_id).await? {
                Assignment::Assigned { .. } => {}
                other => bail!("sensor '{}': plant assignment failed: {other:?}", s.sensor_id),
            }
        }
    }

    tracing::info!(
        plants = config.plants.len(),
        sensors = config.sensors.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
