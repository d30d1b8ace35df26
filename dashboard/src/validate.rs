use serde_json::{Map, Value};

use crate::errors::{Error, Result};
use crate::model::{CommandKind, CommandRecord, StatusRecord};

/// Builds a StatusRecord from a raw status payload.
///
/// Only a payload that is not a JSON object is rejected. Missing or mistyped
/// measurements fall back to `0.0`, a missing `online` flag to `false` and an
/// unusable timestamp to `0`. Fields never carry over from an earlier record.
pub fn sanitize_status(value: &Value) -> Result<StatusRecord> {
    let object = value.as_object().ok_or_else(|| {
        Error::MalformedRecord(format!("status payload is not an object: {}", value))
    })?;

    Ok(StatusRecord {
        cpu_percent: number_or_zero(object, "cpu"),
        memory_percent: number_or_zero(object, "memory"),
        disk_percent: number_or_zero(object, "disk"),
        temperature_celsius: number_or_zero(object, "temperature"),
        online: object.get("online").and_then(Value::as_bool).unwrap_or(false),
        timestamp: object.get("timestamp").and_then(epoch_millis).unwrap_or(0),
    })
}

/// Parses a command payload. Commands are validated strictly: an unknown
/// command name or a missing timestamp is an error.
pub fn parse_command(value: &Value) -> Result<CommandRecord> {
    let object = value.as_object().ok_or_else(|| {
        Error::MalformedRecord(format!("command payload is not an object: {}", value))
    })?;

    let command = object
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedRecord("command name missing".to_string()))?
        .parse::<CommandKind>()?;

    let timestamp = object
        .get("timestamp")
        .and_then(epoch_millis)
        .ok_or_else(|| Error::MalformedRecord("command timestamp missing".to_string()))?;

    Ok(CommandRecord { command, timestamp })
}

fn number_or_zero(object: &Map<String, Value>, field: &str) -> f64 {
    object
        .get(field)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn epoch_millis(value: &Value) -> Option<i64> {
    let millis = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };
    (millis > 0).then_some(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_status() {
        let record = sanitize_status(&json!({
            "cpu": 45, "memory": 60, "disk": 30, "temperature": 52,
            "online": true, "timestamp": 1_700_000_000_000i64
        }))
        .unwrap();

        assert_eq!(record.cpu_percent, 45.0);
        assert_eq!(record.memory_percent, 60.0);
        assert_eq!(record.disk_percent, 30.0);
        assert_eq!(record.temperature_celsius, 52.0);
        assert!(record.online);
        assert_eq!(record.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_partial_status_defaults_to_zero() {
        let record = sanitize_status(&json!({"online": true})).unwrap();

        assert!(record.online);
        assert_eq!(record.cpu_percent, 0.0);
        assert_eq!(record.memory_percent, 0.0);
        assert_eq!(record.disk_percent, 0.0);
        assert_eq!(record.temperature_celsius, 0.0);
        assert!(record.last_updated().is_none());
    }

    #[test]
    fn test_mistyped_fields() {
        let record = sanitize_status(&json!({
            "cpu": "high", "memory": null, "online": "yes", "timestamp": "now"
        }))
        .unwrap();

        assert_eq!(record.cpu_percent, 0.0);
        assert_eq!(record.memory_percent, 0.0);
        assert!(!record.online);
        assert_eq!(record.timestamp, 0);
    }

    #[test]
    fn test_unbounded_values_pass_through() {
        let record = sanitize_status(&json!({"cpu": 250.5, "temperature": -12})).unwrap();
        assert_eq!(record.cpu_percent, 250.5);
        assert_eq!(record.temperature_celsius, -12.0);
    }

    #[test]
    fn test_zero_timestamp_is_unknown() {
        let record = sanitize_status(&json!({"online": true, "timestamp": 0})).unwrap();
        assert_eq!(record.timestamp, 0);
        assert!(record.last_updated().is_none());
    }

    #[test]
    fn test_non_object_status_rejected() {
        assert!(matches!(
            sanitize_status(&json!([1, 2, 3])),
            Err(Error::MalformedRecord(_))
        ));
        assert!(sanitize_status(&json!("online")).is_err());
    }

    #[test]
    fn test_parse_command() {
        let record =
            parse_command(&json!({"command": "shutdown", "timestamp": 1_700_000_000_000i64}))
                .unwrap();
        assert_eq!(record.command, CommandKind::Shutdown);
        assert_eq!(record.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_command_rejects_unknown_name() {
        assert!(parse_command(&json!({"command": "format_disk", "timestamp": 1})).is_err());
    }

    #[test]
    fn test_parse_command_requires_timestamp() {
        assert!(parse_command(&json!({"command": "restart"})).is_err());
    }
}
