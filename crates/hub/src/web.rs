use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;

use consumption::export::{history_csv, periods_csv};
use consumption::{
    filter_history, ConsumptionTotal, DailyConsumption, Event, EventLog, HistoryStats,
    SensorConsumption, TimeRange, TodayConsumption,
};

use crate::config::Settings;
use crate::db::{Assignment, Db, Plant, SensorRecord, RELAY_OFF, RELAY_ON};
use crate::error::{ApiError, ApiResult};
use crate::mqtt::{relay_payload, relay_topic};
use crate::plants::{plant_id_for, DisplayNames, PlantInput};
use crate::state::{HumidityPoint, SharedState, SystemEvent};

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub mqtt: AsyncClient,
    pub settings: Settings,
}

// ---------------------------------------------------------------------------
// Response / request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SensorView {
    #[serde(flatten)]
    pub sensor: SensorRecord,
    pub online: bool,
    pub irrigating: bool,
}

impl SensorView {
    fn new(sensor: SensorRecord, now_ts: i64, timeout_sec: i64) -> Self {
        Self {
            online: sensor.is_online(now_ts, timeout_sec),
            irrigating: sensor.irrigating(),
            sensor,
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub sensors: Vec<SensorView>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub events: Vec<Event>,
    pub stats: HistoryStats,
}

#[derive(Debug, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub rejected: usize,
}

#[derive(Debug, Deserialize)]
pub struct RelayCmd {
    pub on: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssignCmd {
    pub plant_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub range: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl RangeQuery {
    fn time_range(&self) -> ApiResult<TimeRange> {
        Ok(TimeRange::parse(
            self.range.as_deref(),
            self.from.as_deref(),
            self.to.as_deref(),
        )?)
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/chart", get(api_chart))
        .route("/api/sensors", get(list_sensors))
        .route("/api/sensors/{id}/relay", post(set_relay))
        .route("/api/sensors/{id}/plant", put(assign_plant).delete(unassign_plant))
        .route("/api/plants", get(list_plants).post(create_plant))
        .route(
            "/api/plants/{id}",
            get(get_plant).put(update_plant).delete(delete_plant),
        )
        .route("/api/history", get(history))
        .route("/api/history/export.csv", get(history_export))
        .route("/api/history/import", post(history_import))
        .route("/api/consumption", get(consumption_total))
        .route("/api/consumption/today", get(consumption_today))
        .route("/api/consumption/daily", get(consumption_daily))
        .route("/api/consumption/sensors", get(consumption_sensors))
        .route("/api/consumption/export.csv", get(consumption_export))
        .with_state(state)
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

// -- Live status ------------------------------------------------------------

async fn sensor_views(state: &AppState) -> ApiResult<Vec<SensorView>> {
    let now_ts = now().unix_timestamp();
    let timeout = state.settings.online_timeout_sec;
    Ok(state
        .db
        .load_sensors()
        .await?
        .into_iter()
        .map(|s| SensorView::new(s, now_ts, timeout))
        .collect())
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let sensors = sensor_views(&state).await?;
    let st = state.shared.read().await;
    Ok(Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        mqtt_connected: st.mqtt_connected,
        sensors,
        events: st.recent_events(),
    }))
}

async fn api_chart(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<HumidityPoint>>> {
    Json(state.shared.read().await.chart_snapshot())
}

// -- Sensors ----------------------------------------------------------------

async fn list_sensors(State(state): State<AppState>) -> ApiResult<Json<Vec<SensorView>>> {
    Ok(Json(sensor_views(&state).await?))
}

async fn sensor_view(state: &AppState, sensor_id: &str) -> ApiResult<Json<SensorView>> {
    let sensor = state
        .db
        .get_sensor(sensor_id)
        .await?
        .ok_or_else(|| sensor_not_found(sensor_id))?;
    Ok(Json(SensorView::new(
        sensor,
        now().unix_timestamp(),
        state.settings.online_timeout_sec,
    )))
}

fn sensor_not_found(sensor_id: &str) -> ApiError {
    ApiError::NotFound(format!("sensor '{sensor_id}' not found"))
}

async fn set_relay(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Json(cmd): Json<RelayCmd>,
) -> ApiResult<Json<SensorView>> {
    if state.db.get_sensor(&sensor_id).await?.is_none() {
        return Err(sensor_not_found(&sensor_id));
    }

    // Stored state only changes once the command is queued for the broker.
    state
        .mqtt
        .publish(
            relay_topic(&sensor_id),
            QoS::AtLeastOnce,
            false,
            relay_payload(cmd.on),
        )
        .await
        .context("failed to queue relay command")?;

    let relay_state = if cmd.on { RELAY_ON } else { RELAY_OFF };
    if !state.db.set_relay_state(&sensor_id, relay_state).await? {
        return Err(sensor_not_found(&sensor_id));
    }

    tracing::info!(sensor = %sensor_id, on = cmd.on, "relay command sent");
    state.shared.write().await.record_relay(&sensor_id, cmd.on);

    sensor_view(&state, &sensor_id).await
}

async fn assign_plant(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Json(cmd): Json<AssignCmd>,
) -> ApiResult<Json<SensorView>> {
    match state.db.assign_plant(&sensor_id, &cmd.plant_id).await? {
        Assignment::Assigned { min_humidity } => {
            tracing::info!(sensor = %sensor_id, plant = %cmd.plant_id, min_humidity, "plant assigned");
        }
        Assignment::UnknownSensor => return Err(sensor_not_found(&sensor_id)),
        Assignment::UnknownPlant => return Err(plant_not_found(&cmd.plant_id)),
    }
    sensor_view(&state, &sensor_id).await
}

async fn unassign_plant(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> ApiResult<Json<SensorView>> {
    if !state.db.unassign_plant(&sensor_id).await? {
        return Err(sensor_not_found(&sensor_id));
    }
    tracing::info!(sensor = %sensor_id, "plant unassigned");
    sensor_view(&state, &sensor_id).await
}

// -- Plants -----------------------------------------------------------------

fn plant_not_found(plant_id: &str) -> ApiError {
    ApiError::NotFound(format!("plant '{plant_id}' not found"))
}

async fn list_plants(State(state): State<AppState>) -> ApiResult<Json<Vec<Plant>>> {
    Ok(Json(state.db.load_plants().await?))
}

async fn create_plant(
    State(state): State<AppState>,
    Json(input): Json<PlantInput>,
) -> ApiResult<(StatusCode, Json<Plant>)> {
    input.validate()?;
    let plant_id = plant_id_for(&input.name);
    let plant = input.into_plant(plant_id, Db::today_yyyy_mm_dd(state.settings.offset));

    if !state.db.insert_plant(&plant).await? {
        return Err(ApiError::Conflict(format!(
            "plant '{}' already exists",
            plant.plant_id
        )));
    }
    tracing::info!(plant = %plant.plant_id, "plant created");
    Ok((StatusCode::CREATED, Json(plant)))
}

async fn get_plant(
    State(state): State<AppState>,
    Path(plant_id): Path<String>,
) -> ApiResult<Json<Plant>> {
    state
        .db
        .get_plant(&plant_id)
        .await?
        .map(Json)
        .ok_or_else(|| plant_not_found(&plant_id))
}

/// The id stays fixed even if the name changes; a missing `created_at` keeps
/// the stored one.
async fn update_plant(
    State(state): State<AppState>,
    Path(plant_id): Path<String>,
    Json(input): Json<PlantInput>,
) -> ApiResult<Json<Plant>> {
    input.validate()?;
    let existing = state
        .db
        .get_plant(&plant_id)
        .await?
        .ok_or_else(|| plant_not_found(&plant_id))?;

    let plant = input.into_plant(plant_id, existing.created_at);
    if !state.db.update_plant(&plant).await? {
        return Err(plant_not_found(&plant.plant_id));
    }
    tracing::info!(plant = %plant.plant_id, "plant updated");
    Ok(Json(plant))
}

async fn delete_plant(
    State(state): State<AppState>,
    Path(plant_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_plant(&plant_id).await? {
        return Err(plant_not_found(&plant_id));
    }
    tracing::info!(plant = %plant_id, "plant deleted");
    Ok(StatusCode::NO_CONTENT)
}

// -- History ----------------------------------------------------------------

async fn filtered_events(state: &AppState, query: &RangeQuery) -> ApiResult<Vec<Event>> {
    let range = query.time_range()?;
    let events = state.db.load_events().await?;
    Ok(filter_history(&events, range, now(), state.settings.offset))
}

async fn display_names(state: &AppState) -> ApiResult<DisplayNames> {
    let sensors = state.db.load_sensors().await?;
    let plants = state.db.load_plants().await?;
    Ok(DisplayNames::new(&sensors, &plants))
}

fn csv_response(prefix: &str, state: &AppState, body: String) -> Response {
    let filename = format!(
        "attachment; filename=\"{prefix}_{}.csv\"",
        Db::today_yyyy_mm_dd(state.settings.offset)
    );
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, filename),
        ],
        body,
    )
        .into_response()
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let events = filtered_events(&state, &query).await?;
    let stats = HistoryStats::from_events(&events);
    Ok(Json(HistoryResponse { events, stats }))
}

async fn history_export(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Response> {
    let events = filtered_events(&state, &query).await?;
    let names = display_names(&state).await?;
    let body = history_csv(&events, |s| names.name_of(s))?;
    Ok(csv_response("historial_riego", &state, body))
}

/// Bulk-load a history dump: a JSON array of records, or an object keyed by
/// record id. Invalid records are counted and skipped.
async fn history_import(
    State(state): State<AppState>,
    Json(dump): Json<serde_json::Value>,
) -> ApiResult<Json<ImportSummary>> {
    if !(dump.is_array() || dump.is_object()) {
        return Err(ApiError::BadRequest(
            "history dump must be a JSON array or object".to_string(),
        ));
    }
    let log = EventLog::from_json(&dump);
    let imported = state.db.insert_events(log.events()).await?;

    tracing::info!(imported, rejected = log.rejected(), "history imported");
    state
        .shared
        .write()
        .await
        .record_system(format!("history import: {imported} records"));

    Ok(Json(ImportSummary {
        imported,
        rejected: log.rejected(),
    }))
}

// -- Consumption ------------------------------------------------------------

async fn consumption_total(State(state): State<AppState>) -> ApiResult<Json<ConsumptionTotal>> {
    let events = state.db.load_events().await?;
    Ok(Json(state.settings.aggregator().total(&events)))
}

async fn consumption_today(State(state): State<AppState>) -> ApiResult<Json<TodayConsumption>> {
    let events = state.db.load_events().await?;
    Ok(Json(state.settings.aggregator().today(&events, now())))
}

async fn consumption_daily(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<DailyConsumption>>> {
    let events = state.db.load_events().await?;
    Ok(Json(state.settings.aggregator().by_day(&events)))
}

async fn consumption_sensors(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<SensorConsumption>>> {
    let events = state.db.load_events().await?;
    Ok(Json(state.settings.aggregator().by_sensor(&events)))
}

async fn consumption_export(State(state): State<AppState>) -> ApiResult<Response> {
    let events = state.db.load_events().await?;
    let periods = state.settings.aggregator().periods(&events);
    let names = display_names(&state).await?;
    let body = periods_csv(&periods, |s| names.name_of(s))?;
    Ok(csv_response("consumo_agua", &state, body))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    if serve_tls(addr, app.clone()).await? {
        return Ok(());
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    tracing::info!(%addr, "web api listening on http");

    axum::serve(listener, app).await.context("web server error")
}

/// Serves HTTPS when `TLS_CERT` and `TLS_KEY` are both set. Returns false
/// without serving otherwise.
#[cfg(feature = "tls")]
async fn serve_tls(addr: SocketAddr, app: Router) -> Result<bool> {
    use axum_server::tls_rustls::RustlsConfig;

    let (Ok(cert), Ok(key)) = (env::var("TLS_CERT"), env::var("TLS_KEY")) else {
        return Ok(false);
    };
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("failed to load tls cert={cert} key={key}"))?;

    tracing::info!(%addr, "web api listening on https");
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .context("web server error")?;
    Ok(true)
}

#[cfg(not(feature = "tls"))]
async fn serve_tls(_addr: SocketAddr, _app: Router) -> Result<bool> {
    Ok(false)
}

// ===========================================================================
// Tests
// ===========================================================================
