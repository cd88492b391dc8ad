mod config;
mod db;
mod error;
mod mqtt;
mod plants;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::Path, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use config::Config;
use db::Db;
use mqtt::{handle_publish, HISTORY_FILTER, READING_FILTER};
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (hub settings, seed plants + sensors) ────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        tracing::warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };
    let settings = cfg.settings()?;
    config::apply(&cfg, &db, &settings).await?;

    let sensors = db.load_sensors().await?;
    if sensors.is_empty() {
        tracing::warn!("no sensors registered; telemetry will not be stored");
    }
    tracing::info!(
        sensors = sensors.len(),
        plants = db.load_plants().await?.len(),
        utc_offset = %settings.offset,
        flow_rate = settings.flow_rate_l_per_min,
        "db ready"
    );

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Web server ──────────────────────────────────────────────────
    let app_state = AppState {
        shared: shared.clone(),
        db: db.clone(),
        mqtt: client.clone(),
        settings,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state).await {
            tracing::error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Err(e) =
                    handle_publish(&p.topic, &p.payload, &db, &shared, OffsetDateTime::now_utc()).await
                {
                    tracing::warn!(topic = %p.topic, error = %format!("{e:#}"), "publish rejected");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect. The
                // event loop is this task, so queue without waiting on it.
                for filter in [READING_FILTER, HISTORY_FILTER] {
                    if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
                        tracing::error!(filter, error = %e, "subscribe failed");
                    }
                }
                tracing::info!("hub subscribed to {READING_FILTER} and {HISTORY_FILTER}");

                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "mqtt error, reconnecting");

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
