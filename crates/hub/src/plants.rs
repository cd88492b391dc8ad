//! Plant catalog rules (id derivation, validation) and the sensor → display
//! name lookup used by reports and exports.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

use crate::db::{Plant, SensorRecord};

/// Every violation found in a plant entry, not just the first.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantErrors(pub Vec<String>);

impl fmt::Display for PlantErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for PlantErrors {}

/// Plant fields as entered by a user or listed in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlantInput {
    pub name: String,
    pub min_humidity: f64,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Lowercased name with all whitespace removed: "Menta Piperita" -> "mentapiperita".
pub fn plant_id_for(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect()
}

impl PlantInput {
    pub fn validate(&self) -> Result<(), PlantErrors> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if !(0.0..=100.0).contains(&self.min_humidity) {
            errors.push(format!(
                "min_humidity {} out of range [0, 100]",
                self.min_humidity
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PlantErrors(errors))
        }
    }

    /// Build the stored record. `today` fills in a missing creation date.
    pub fn into_plant(self, plant_id: String, today: String) -> Plant {
        Plant {
            plant_id,
            name: self.name.trim().to_string(),
            min_humidity: self.min_humidity,
            created_at: self
                .created_at
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(today),
        }
    }
}

// ---------------------------------------------------------------------------
// Display names
// ---------------------------------------------------------------------------

/// Resolves a sensor id to what users call it: the assigned plant's name,
/// else the raw plant id, else the sensor id itself.
#[derive(Debug, Clone, Default)]
pub struct DisplayNames {
    names: HashMap<String, String>,
}

impl DisplayNames {
    pub fn new(sensors: &[SensorRecord], plants: &[Plant]) -> Self {
        let plant_names: HashMap<&str, &str> = plants
            .iter()
            .map(|p| (p.plant_id.as_str(), p.name.as_str()))
            .collect();

        let names = sensors
            .iter()
            .filter_map(|s| {
                let plant_id = s.plant_id.as_deref()?;
                let name = plant_names.get(plant_id).copied().unwrap_or(plant_id);
                Some((s.sensor_id.clone(), name.to_string()))
            })
            .collect();

        Self { names }
    }

    pub fn name_of(&self, sensor_id: &str) -> String {
        self.names
            .get(sensor_id)
            .cloned()
            .unwrap_or_else(|| sensor_id.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
