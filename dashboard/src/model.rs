use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Device-reported health snapshot, as published on the status key.
///
/// Every write replaces the previous record wholesale. Missing measurements
/// are represented as `0.0` and a missing timestamp as `0`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRecord {
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_percent: f64,
    #[serde(rename = "disk")]
    pub disk_percent: f64,
    #[serde(rename = "temperature")]
    pub temperature_celsius: f64,
    pub online: bool,
    /// Epoch millis stamped by the device at publish time; `0` when unknown.
    pub timestamp: i64,
}

impl StatusRecord {
    /// Publish time of the record, if the device supplied a usable one.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        if self.timestamp <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

/// Operator instruction carried on the command key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Restart,
    UpdateStatus,
    ClearCache,
    Shutdown,
}

impl CommandKind {
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Restart,
        CommandKind::UpdateStatus,
        CommandKind::ClearCache,
        CommandKind::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Restart => "restart",
            CommandKind::UpdateStatus => "update_status",
            CommandKind::ClearCache => "clear_cache",
            CommandKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::MalformedRecord(format!("unknown command '{}'", s)))
    }
}

/// The single current command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: CommandKind,
    pub timestamp: i64,
}

/// Lifecycle of a dispatch as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Sending,
    Failed(String),
}

/// REST body for `POST /api/v1/commands`
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// REST response for `GET /api/v1/connectivity`
#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    pub online: bool,
    pub state: crate::connectivity::ConnectivityState,
    pub last_updated: Option<DateTime<Utc>>,
}

/// REST response for `GET /api/v1/status`
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: Option<StatusRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_names() {
        for kind in CommandKind::ALL {
            assert_eq!(kind.as_str().parse::<CommandKind>().unwrap(), kind);
        }
        assert!("reboot".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_command_record_wire_shape() {
        let record = CommandRecord {
            command: CommandKind::ClearCache,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"command": "clear_cache", "timestamp": 1_700_000_000_000i64})
        );
    }

    #[test]
    fn test_status_wire_names() {
        let record = StatusRecord {
            cpu_percent: 45.0,
            memory_percent: 60.0,
            disk_percent: 30.0,
            temperature_celsius: 52.0,
            online: true,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["cpu"], 45.0);
        assert_eq!(value["temperature"], 52.0);
        assert_eq!(value["online"], true);
    }

    #[test]
    fn test_last_updated_requires_positive_timestamp() {
        let mut record = StatusRecord::default();
        assert!(record.last_updated().is_none());

        record.timestamp = 1_700_000_000_000;
        assert_eq!(
            record.last_updated().unwrap().timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[test]
    fn test_dispatch_state_serialization() {
        let failed = serde_json::to_value(DispatchState::Failed("boom".into())).unwrap();
        assert_eq!(failed, serde_json::json!({"state": "failed", "reason": "boom"}));
        let idle = serde_json::to_value(DispatchState::Idle).unwrap();
        assert_eq!(idle, serde_json::json!({"state": "idle"}));
    }
}
