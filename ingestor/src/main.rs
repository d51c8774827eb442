mod batching;
mod clients;
mod config;
mod db;
mod decode;
mod errors;
mod fft;
mod metrics;
mod model;
mod mqtt;
mod rest;
mod sensors;
mod ui;
mod window;

use axum::{routing::get, Router};
use clients::ClientRegistry;
use config::Config;
use db::PgStorage;
use mqtt::{Dispatcher, MqttSettings};
use sensors::ActiveSensors;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ui::UiDistributor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting vibration ingestor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
    }

    let storage = match PgStorage::connect(&config.database_url).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    let shutdown = CancellationToken::new();
    let (db_tx, db_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let settings = MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: config.mqtt_client_id.clone(),
        topic: config.mqtt_topic.clone(),
        reconnect_delay: config.reconnect_delay,
    };
    let mqtt_shutdown = shutdown.clone();
    let mqtt_handle = tokio::spawn(async move {
        let dispatcher = Dispatcher::new(db_tx, ui_tx);
        if let Err(e) = mqtt::run_mqtt(settings, dispatcher, mqtt_shutdown).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let batcher_handle = tokio::spawn(batching::run_batcher(
        db_rx,
        storage.clone(),
        config.batch_size,
        shutdown.clone(),
    ));

    let registry = Arc::new(ClientRegistry::new());
    let distributor = UiDistributor::new(
        registry.clone(),
        Arc::new(ActiveSensors::new(config.sensor_idle)),
        config.fft_window,
        config.roster_interval,
    );
    let ui_handle = tokio::spawn(distributor.run(ui_rx, shutdown.clone()));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(storage))
        .merge(clients::create_router(registry, shutdown.clone()));

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    info!("Shutting down");
    shutdown.cancel();

    for (name, handle) in [
        ("MQTT listener", mqtt_handle),
        ("batcher", batcher_handle),
        ("UI distributor", ui_handle),
        ("HTTP server", server_handle),
    ] {
        join_with_grace(name, handle).await;
    }

    info!("Shutdown complete");
}

async fn join_with_grace(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(())) => info!("{} stopped", name),
        Ok(Err(e)) => error!("{} task panicked: {}", name, e),
        Err(_) => warn!("{} did not stop within {:?}", name, SHUTDOWN_GRACE),
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
