use axum::{routing::get, Router};
use dashboard::channel::SharedStateChannel;
use dashboard::clock::{Clock, SystemClock};
use dashboard::config::Config;
use dashboard::dispatcher::CommandDispatcher;
use dashboard::metrics;
use dashboard::mqtt::MqttChannel;
use dashboard::observer::StatusObserver;
use dashboard::rest::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    info!("Starting device dashboard");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Status key: {}, command key: {}, liveness: {:?}, heartbeat timeout: {:?}",
        config.status_key, config.command_key, config.liveness_rule, config.heartbeat_timeout
    );

    // Initialize metrics
    metrics::init_metrics();

    let (mqtt, mqtt_handle) = MqttChannel::connect(&config.mqtt_settings());
    if !mqtt.wait_connected(Duration::from_secs(10)).await {
        warn!("Broker not reachable yet, status will show as degraded until it is");
    }

    let channel: Arc<dyn SharedStateChannel> = Arc::new(mqtt);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let observer = Arc::new(StatusObserver::start(
        Arc::clone(&channel),
        config.observer_config(),
        Arc::clone(&clock),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&channel),
        config.command_key.clone(),
        clock,
    ));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState {
            observer: Arc::clone(&observer),
            dispatcher,
        }));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    observer.shutdown().await;
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
