use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

use irrigation_backend::api;
use irrigation_backend::bus::mqtt::MqttBus;
use irrigation_backend::bus::{topics, CommandBus};
use irrigation_backend::config::AppConfig;
use irrigation_backend::db;
use irrigation_backend::error::{EngineError, EngineResult};
use irrigation_backend::services::runtime::IrrigationService;
use irrigation_backend::store::{PgStore, Stores};

/// Inbound messages buffered between the MQTT event loop and dispatch.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

// One multi-threaded runtime for the HTTP workers, cron jobs and dispatch task.
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Err(e) = run().await {
        error!("Irrigation backend failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> EngineResult<()> {
    let config = AppConfig::from_env()?;

    // DB Pool initialization
    let pool = db::init_pool(&config.database_url)?;
    let stores = Stores::shared(Arc::new(PgStore::new(pool)));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let mqtt = MqttBus::connect(
        config.mqtt.clone(),
        topics::subscription_patterns(),
        config.mqtt_qos,
        inbound_tx,
    )?;
    let bus = CommandBus::new(Arc::new(mqtt), config.mqtt_qos);

    let service = web::Data::new(IrrigationService::new(
        stores,
        bus,
        config.timezone,
        config.local_run_timers,
        config.runtime_settings(),
    ));
    service.start(inbound_rx).await?;

    info!(
        "Starting Irrigation Backend at http://{} (schedules in {})",
        config.bind_addr, config.timezone
    );

    let app_service = service.clone();
    let served = match HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(app_service.clone())
            .configure(api::config)
    })
    .bind(config.bind_addr.as_str())
    {
        Ok(server) => server
            .run()
            .await
            .map_err(|e| EngineError::Transport(format!("HTTP server failed: {}", e))),
        Err(e) => Err(EngineError::Config(format!(
            "BIND_ADDR {}: {}",
            config.bind_addr, e
        ))),
    };

    service.stop().await;
    served
}
