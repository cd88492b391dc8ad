use anyhow::{Context, Result};
use consumption::Event;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::{OffsetDateTime, UtcOffset};

/// Relay boards are active-low: 0 drives the pump, 1 stops it.
pub const RELAY_ON: i64 = 0;
pub const RELAY_OFF: i64 = 1;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plant {
    pub plant_id: String,
    pub name: String,
    /// Percent, 0..=100.
    pub min_humidity: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SensorRecord {
    pub sensor_id: String,
    pub name: String,
    pub plant_id: Option<String>,
    pub min_humidity: Option<f64>,
    pub humidity: Option<f64>,
    pub relay_state: i64,
    pub last_seen: Option<i64>,
}

impl SensorRecord {
    pub fn irrigating(&self) -> bool {
        self.relay_state == RELAY_ON
    }

    /// Seen within the last `timeout_sec` seconds.
    pub fn is_online(&self, now_ts: i64, timeout_sec: i64) -> bool {
        self.last_seen
            .map(|seen| now_ts - seen < timeout_sec)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Assigned { min_humidity: f64 },
    UnknownSensor,
    UnknownPlant,
}

#[derive(FromRow)]
struct EventRow {
    sensor: String,
    accion: String,
    ts: i64,
    fecha: String,
}

impl From<EventRow> for Event {
    fn from(r: EventRow) -> Self {
        Event::new(r.sensor, r.accion, r.ts).with_fecha(r.fecha)
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn today_yyyy_mm_dd(offset: UtcOffset) -> String {
        let now = OffsetDateTime::now_utc().to_offset(offset);
        format!("{:04}-{:02}-{:02}", now.year(), now.month() as u8, now.day())
    }

    // ----------------------------
    // Plants
    // ----------------------------

    /// Insert or overwrite (config seeding).
    pub async fn upsert_plant(&self, p: &Plant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plants (plant_id, name, min_humidity, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              name=excluded.name,
              min_humidity=excluded.min_humidity
            "#,
        )
        .bind(&p.plant_id)
        .bind(&p.name)
        .bind(p.min_humidity)
        .bind(&p.created_at)
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    /// Returns false if a plant with the same id already exists.
    pub async fn insert_plant(&self, p: &Plant) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO plants (plant_id, name, min_humidity, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(plant_id) DO NOTHING
            "#,
        )
        .bind(&p.plant_id)
        .bind(&p.name)
        .bind(p.min_humidity)
        .bind(&p.created_at)
        .execute(&self.pool)
        .await
        .context("insert_plant failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn load_plants(&self) -> Result<Vec<Plant>> {
        sqlx::query_as::<_, Plant>(
            "SELECT plant_id, name, min_humidity, created_at FROM plants ORDER BY plant_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_plants failed")
    }

    pub async fn get_plant(&self, plant_id: &str) -> Result<Option<Plant>> {
        sqlx::query_as::<_, Plant>(
            "SELECT plant_id, name, min_humidity, created_at FROM plants WHERE plant_id = ?",
        )
        .bind(plant_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_plant failed")
    }

    /// Returns false if the plant does not exist.
    pub async fn update_plant(&self, p: &Plant) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE plants
            SET name = ?, min_humidity = ?, created_at = ?
            WHERE plant_id = ?
            "#,
        )
        .bind(&p.name)
        .bind(p.min_humidity)
        .bind(&p.created_at)
        .bind(&p.plant_id)
        .execute(&self.pool)
        .await
        .context("update_plant failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Sensors assigned to the plant lose their assignment.
    pub async fn delete_plant(&self, plant_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM plants WHERE plant_id = ?")
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("delete_plant failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    /// Register a sensor or rename it. Live state is left alone.
    pub async fn upsert_sensor(&self, sensor_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, name)
            VALUES (?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET name=excluded.name
            "#,
        )
        .bind(sensor_id)
        .bind(name)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn load_sensors(&self) -> Result<Vec<SensorRecord>> {
        sqlx::query_as::<_, SensorRecord>(
            r#"
            SELECT sensor_id, name, plant_id, min_humidity, humidity, relay_state, last_seen
            FROM sensors
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_sensors failed")
    }

    pub async fn get_sensor(&self, sensor_id: &str) -> Result<Option<SensorRecord>> {
        sqlx::query_as::<_, SensorRecord>(
            r#"
            SELECT sensor_id, name, plant_id, min_humidity, humidity, relay_state, last_seen
            FROM sensors
            WHERE sensor_id = ?
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor failed")
    }

    /// Store a telemetry sample. Returns false for unregistered sensors.
    pub async fn record_reading(
        &self,
        sensor_id: &str,
        humidity: f64,
        relay_state: Option<i64>,
        ts: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE sensors
            SET humidity = ?, relay_state = COALESCE(?, relay_state), last_seen = ?
            WHERE sensor_id = ?
            "#,
        )
        .bind(humidity)
        .bind(relay_state)
        .bind(ts)
        .bind(sensor_id)
        .execute(&self.pool)
        .await
        .context("record_reading failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn set_relay_state(&self, sensor_id: &str, relay_state: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE sensors SET relay_state = ? WHERE sensor_id = ?")
            .bind(relay_state)
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("set_relay_state failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Assign a plant and copy its minimum humidity onto the sensor.
    pub async fn assign_plant(&self, sensor_id: &str, plant_id: &str) -> Result<Assignment> {
        let Some(plant) = self.get_plant(plant_id).await? else {
            return Ok(Assignment::UnknownPlant);
        };

        let res = sqlx::query("UPDATE sensors SET plant_id = ?, min_humidity = ? WHERE sensor_id = ?")
            .bind(&plant.plant_id)
            .bind(plant.min_humidity)
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("assign_plant failed")?;

        Ok(if res.rows_affected() == 1 {
            Assignment::Assigned {
                min_humidity: plant.min_humidity,
            }
        } else {
            Assignment::UnknownSensor
        })
    }

    pub async fn unassign_plant(&self, sensor_id: &str) -> Result<bool> {
        let res = sqlx::query("UPDATE sensors SET plant_id = NULL WHERE sensor_id = ?")
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("unassign_plant failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // History log
    // ----------------------------

    pub async fn insert_event(&self, e: &Event, humidity: Option<f64>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (sensor, accion, ts, fecha, humidity)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.sensor)
        .bind(&e.accion)
        .bind(e.timestamp)
        .bind(&e.fecha)
        .bind(humidity)
        .execute(&self.pool)
        .await
        .context("insert_event failed")?;
        Ok(())
    }

    /// Append a batch in one transaction; all or nothing.
    pub async fn insert_events(&self, events: &[Event]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("insert_events: begin failed")?;
        for e in events {
            sqlx::query("INSERT INTO events (sensor, accion, ts, fecha) VALUES (?, ?, ?, ?)")
                .bind(&e.sensor)
                .bind(&e.accion)
                .bind(e.timestamp)
                .bind(&e.fecha)
                .execute(&mut *tx)
                .await
                .context("insert_events failed")?;
        }
        tx.commit().await.context("insert_events: commit failed")?;
        Ok(events.len())
    }

    /// Full snapshot of the history log in insertion order.
    pub async fn load_events(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT sensor, accion, ts, fecha FROM events ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_events failed")?;

        Ok(rows.into_iter().map(Event::from).collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
