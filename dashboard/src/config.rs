use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::connectivity::{ConnectivityPolicy, LivenessRule};
use crate::mqtt::MqttSettings;
use crate::observer::ObserverConfig;

/// Dashboard settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub http_addr: String,
    pub status_key: String,
    pub command_key: String,
    pub heartbeat_timeout: Duration,
    pub liveness_rule: LivenessRule,
    pub resubscribe_initial_backoff: Duration,
    pub resubscribe_max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: format!("dashboard-{}", uuid::Uuid::new_v4()),
            http_addr: "0.0.0.0:8080".to_string(),
            status_key: "pi/status".to_string(),
            command_key: "pi/commands".to_string(),
            heartbeat_timeout: Duration::from_millis(15_000),
            liveness_rule: LivenessRule::SelfReportedAndFresh,
            resubscribe_initial_backoff: Duration::from_millis(500),
            resubscribe_max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source. Unparsable values keep
    /// their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, name, default.as_millis() as u64))
        };

        Self {
            mqtt_broker: lookup("MQTT_BROKER").unwrap_or(defaults.mqtt_broker),
            mqtt_port: parse_or(&lookup, "MQTT_PORT", defaults.mqtt_port),
            mqtt_client_id: lookup("MQTT_CLIENT_ID").unwrap_or(defaults.mqtt_client_id),
            http_addr: lookup("HTTP_ADDR").unwrap_or(defaults.http_addr),
            status_key: lookup("STATUS_KEY").unwrap_or(defaults.status_key),
            command_key: lookup("COMMAND_KEY").unwrap_or(defaults.command_key),
            heartbeat_timeout: millis("HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout),
            liveness_rule: parse_or(&lookup, "CONNECTIVITY_POLICY", defaults.liveness_rule),
            resubscribe_initial_backoff: millis(
                "RESUBSCRIBE_INITIAL_BACKOFF_MS",
                defaults.resubscribe_initial_backoff,
            ),
            resubscribe_max_backoff: millis(
                "RESUBSCRIBE_MAX_BACKOFF_MS",
                defaults.resubscribe_max_backoff,
            ),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker: self.mqtt_broker.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            keep_alive: Duration::from_secs(30),
        }
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            key: self.status_key.clone(),
            policy: ConnectivityPolicy {
                rule: self.liveness_rule,
                heartbeat_timeout: self.heartbeat_timeout,
            },
            initial_backoff: self.resubscribe_initial_backoff,
            max_backoff: self.resubscribe_max_backoff,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Ignoring invalid {}={:?}: {}", name, raw, e);
            default
        }),
    }
}
