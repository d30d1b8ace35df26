use crate::telemetry::CommandRecord;
use tracing::{debug, warn};

/// Filters the command slot down to commands this session should act on.
///
/// The slot keeps its last value forever, so a device that (re)subscribes
/// is handed the previous command again as a retained copy. The first
/// retained copy of a session only sets the baseline; after that a command
/// runs when it is newer than the last one seen. Comparisons only ever
/// involve timestamps stamped by the dashboard.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    last_handled: Option<i64>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `retained` marks the broker's stored copy delivered on subscribe, as
    /// opposed to a live write.
    pub fn accept(&mut self, payload: &[u8], retained: bool) -> Option<CommandRecord> {
        if payload.is_empty() {
            return None;
        }
        let record = match serde_json::from_slice::<CommandRecord>(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Ignoring unreadable command {}: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
                return None;
            }
        };

        match self.last_handled {
            None if retained => {
                debug!(
                    "Command {:?} issued at {} predates this session",
                    record.command, record.timestamp
                );
                self.last_handled = Some(record.timestamp);
                return None;
            }
            Some(last) if record.timestamp <= last => {
                debug!(
                    "Ignoring stale command {:?} issued at {} (last handled {})",
                    record.command, record.timestamp, last
                );
                return None;
            }
            _ => {}
        }

        self.last_handled = Some(record.timestamp);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Command;

    const T0: i64 = 1_700_000_000_000;

    fn payload(command: &str, timestamp: i64) -> Vec<u8> {
        format!(r#"{{"command":"{}","timestamp":{}}}"#, command, timestamp).into_bytes()
    }

    #[test]
    fn test_retained_command_on_first_subscribe_is_baseline() {
        let mut executor = CommandExecutor::new();
        assert!(executor.accept(&payload("shutdown", T0), true).is_none());
        // the same retained copy again after a reconnect
        assert!(executor.accept(&payload("shutdown", T0), true).is_none());
        assert!(executor.accept(&payload("restart", T0 + 1), false).is_some());
    }

    #[test]
    fn test_live_command_runs_without_baseline() {
        // empty slot at subscribe time, so no retained copy arrives
        let mut executor = CommandExecutor::new();
        let record = executor.accept(&payload("restart", T0), false).unwrap();
        assert_eq!(record.command, Command::Restart);
    }

    #[test]
    fn test_dashboard_clock_behind_device_still_accepted() {
        // timestamps far in the device's past are fine as long as they move forward
        let mut executor = CommandExecutor::new();
        let old = T0 - 3_600_000;
        assert!(executor.accept(&payload("clear_cache", old), true).is_none());
        assert!(executor.accept(&payload("restart", old + 1), false).is_some());
    }

    #[test]
    fn test_command_missed_while_disconnected_runs_on_resubscribe() {
        let mut executor = CommandExecutor::new();
        assert!(executor.accept(&payload("restart", T0), false).is_some());
        assert!(executor.accept(&payload("update_status", T0 + 10), true).is_some());
    }

    #[test]
    fn test_new_command_accepted_once() {
        let mut executor = CommandExecutor::new();
        assert!(executor.accept(&payload("restart", T0), false).is_some());
        // redelivery of the same slot value
        assert!(executor.accept(&payload("restart", T0), false).is_none());
        assert!(executor.accept(&payload("clear_cache", T0 + 1), false).is_some());
    }

    #[test]
    fn test_unknown_or_cleared_commands_ignored() {
        let mut executor = CommandExecutor::new();
        assert!(executor.accept(&payload("self_destruct", T0), true).is_none());
        assert!(executor.accept(b"", true).is_none());
        assert!(executor.accept(b"{}", false).is_none());
        // rejected payloads don't set the baseline
        assert!(executor.accept(&payload("update_status", T0), false).is_some());
    }
}
