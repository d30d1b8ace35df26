mod executor;
mod telemetry;

use chrono::Utc;
use clap::Parser;
use executor::CommandExecutor;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::{Command, CommandRecord, StatusRecord};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Plays the device: publishes status and executes dashboard commands.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "STATUS_KEY", default_value = "pi/status")]
    status_key: String,

    #[arg(long, env = "COMMAND_KEY", default_value = "pi/commands")]
    command_key: String,

    /// Milliseconds between status publishes
    #[arg(long, env = "INTERVAL_MS", default_value_t = 5000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, status: {}, commands: {}, interval: {}ms",
        args.broker, args.port, args.status_key, args.command_key, args.interval_ms
    );

    let client_id = format!("device-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    let (command_tx, mut command_rx) = mpsc::channel::<(Vec<u8>, bool)>(32);

    // Spawn eventloop handler
    let subscriber = client.clone();
    let command_key = args.command_key.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // clean sessions forget subscriptions, so re-arm on every connect
                    info!("Connected, subscribing to {}", command_key);
                    if let Err(e) = subscriber.try_subscribe(&command_key, QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", command_key, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == command_key => {
                    if command_tx
                        .send((publish.payload.to_vec(), publish.retain))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut executor = CommandExecutor::new();
    let mut last_timestamp = 0;
    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = generate_status(&mut rng, &mut last_timestamp, true);
                publish_status(&client, &args.status_key, &status).await;
            }
            command = command_rx.recv() => {
                let Some((payload, retained)) = command else {
                    error!("MQTT task terminated");
                    break;
                };
                let Some(record) = executor.accept(&payload, retained) else {
                    continue;
                };
                let stop = handle_command(
                    &client,
                    &args.status_key,
                    record,
                    &mut rng,
                    &mut last_timestamp,
                )
                .await;
                if stop {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                let status = generate_status(&mut rng, &mut last_timestamp, false);
                publish_status(&client, &args.status_key, &status).await;
                break;
            }
        }
    }

    // let the eventloop flush the final publish
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Simulator stopped");
}

/// Acts on an accepted command. Returns true when the device should stop.
async fn handle_command(
    client: &AsyncClient,
    status_key: &str,
    record: CommandRecord,
    rng: &mut impl Rng,
    last_timestamp: &mut i64,
) -> bool {
    info!("Handling command {:?} issued at {}", record.command, record.timestamp);

    match record.command {
        Command::Restart => {
            info!("Restarting service...");
            let status = generate_status(rng, last_timestamp, true);
            publish_status(client, status_key, &status).await;
            false
        }
        Command::UpdateStatus => {
            info!("Forcing status update...");
            let status = generate_status(rng, last_timestamp, true);
            publish_status(client, status_key, &status).await;
            false
        }
        Command::ClearCache => {
            info!("Clearing cache...");
            false
        }
        Command::Shutdown => {
            info!("Shutting down...");
            let status = generate_status(rng, last_timestamp, false);
            publish_status(client, status_key, &status).await;
            true
        }
    }
}

async fn publish_status(client: &AsyncClient, status_key: &str, status: &StatusRecord) {
    let payload = match serde_json::to_string(status) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize status: {}", e);
            return;
        }
    };

    match client.publish(status_key, QoS::AtLeastOnce, true, payload).await {
        Ok(()) => info!(
            "Status updated: CPU={:.1}%, Memory={:.1}%, online={}",
            status.cpu, status.memory, status.online
        ),
        Err(e) => warn!("Failed to publish status: {}", e),
    }
}

/// Timestamps never repeat or go backwards within a session, even if the
/// wall clock does.
fn next_timestamp(last_timestamp: &mut i64) -> i64 {
    let now = Utc::now().timestamp_millis();
    *last_timestamp = now.max(*last_timestamp + 1);
    *last_timestamp
}

fn generate_status(rng: &mut impl Rng, last_timestamp: &mut i64, online: bool) -> StatusRecord {
    let cpu = if rng.gen_bool(0.05) {
        rng.gen_range(80.0..100.0) // 5% load spikes
    } else {
        rng.gen_range(2.0..40.0)
    };

    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(70.0..85.0) // 5% thermal throttling range
    } else {
        rng.gen_range(40.0..60.0)
    };

    StatusRecord {
        cpu: round2(cpu),
        memory: round2(rng.gen_range(20.0..70.0)),
        disk: round2(rng.gen_range(30.0..35.0)),
        temperature: round2(temperature),
        online,
        timestamp: next_timestamp(last_timestamp),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
