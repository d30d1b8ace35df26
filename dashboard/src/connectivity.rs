use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

use crate::model::StatusRecord;

/// Returns true when a record published at `record_timestamp` is older than
/// `timeout` at `now_ms`. A record without a usable timestamp is always stale.
/// Timestamps ahead of `now_ms` (device clock skew) count as fresh.
pub fn is_stale(now_ms: i64, record_timestamp: i64, timeout: Duration) -> bool {
    if record_timestamp <= 0 {
        return true;
    }
    let age_ms = now_ms.saturating_sub(record_timestamp);
    age_ms > timeout.as_millis() as i64
}

/// How the self-reported `online` flag and heartbeat age combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessRule {
    /// Trust the device's `online` flag only.
    SelfReported,
    /// Trust heartbeat age only; the flag is ignored.
    Fresh,
    /// The device must say it is online and the record must be fresh.
    SelfReportedAndFresh,
}

impl FromStr for LivenessRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self_reported" => Ok(LivenessRule::SelfReported),
            "fresh" => Ok(LivenessRule::Fresh),
            "self_reported_and_fresh" => Ok(LivenessRule::SelfReportedAndFresh),
            other => Err(format!("unknown liveness rule '{}'", other)),
        }
    }
}

/// What the operator is shown about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// No status record has ever been observed.
    Unknown,
    Connected,
    /// The latest record says the device is offline.
    Disconnected,
    /// The heartbeat timed out.
    Stale,
    /// The status subscription is broken; the latest record may be outdated.
    Degraded,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectivityPolicy {
    pub rule: LivenessRule,
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectivityPolicy {
    fn default() -> Self {
        Self {
            rule: LivenessRule::SelfReportedAndFresh,
            // three missed 5s publish ticks
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

impl ConnectivityPolicy {
    /// Base behaviour: connectivity is exactly `record.online`.
    pub fn self_reported() -> Self {
        Self {
            rule: LivenessRule::SelfReported,
            ..Self::default()
        }
    }

    pub fn evaluate(
        &self,
        record: Option<&StatusRecord>,
        now_ms: i64,
        subscription_healthy: bool,
    ) -> ConnectivityState {
        if !subscription_healthy {
            return ConnectivityState::Degraded;
        }
        let Some(record) = record else {
            return ConnectivityState::Unknown;
        };

        let stale = || is_stale(now_ms, record.timestamp, self.heartbeat_timeout);
        match self.rule {
            LivenessRule::SelfReported if record.online => ConnectivityState::Connected,
            LivenessRule::SelfReported => ConnectivityState::Disconnected,
            LivenessRule::Fresh if stale() => ConnectivityState::Stale,
            LivenessRule::Fresh => ConnectivityState::Connected,
            LivenessRule::SelfReportedAndFresh if !record.online => {
                ConnectivityState::Disconnected
            }
            LivenessRule::SelfReportedAndFresh if stale() => ConnectivityState::Stale,
            LivenessRule::SelfReportedAndFresh => ConnectivityState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_020_000;
    const TIMEOUT: Duration = Duration::from_secs(15);

    fn record(online: bool, timestamp: i64) -> StatusRecord {
        StatusRecord {
            online,
            timestamp,
            ..Default::default()
        }
    }

    fn policy(rule: LivenessRule) -> ConnectivityPolicy {
        ConnectivityPolicy {
            rule,
            heartbeat_timeout: TIMEOUT,
        }
    }

    #[test]
    fn test_is_stale_boundaries() {
        assert!(!is_stale(NOW, NOW, TIMEOUT));
        assert!(!is_stale(NOW, NOW - 15_000, TIMEOUT));
        assert!(is_stale(NOW, NOW - 15_001, TIMEOUT));
    }

    #[test]
    fn test_missing_timestamp_is_stale() {
        assert!(is_stale(NOW, 0, TIMEOUT));
        assert!(is_stale(NOW, -5, TIMEOUT));
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        assert!(!is_stale(NOW, NOW + 60_000, TIMEOUT));
    }

    #[test]
    fn test_never_heard_is_unknown() {
        for rule in [
            LivenessRule::SelfReported,
            LivenessRule::Fresh,
            LivenessRule::SelfReportedAndFresh,
        ] {
            let state = policy(rule).evaluate(None, NOW, true);
            assert_eq!(state, ConnectivityState::Unknown);
            assert!(!state.is_online());
        }
    }

    #[test]
    fn test_self_reported_follows_flag() {
        let p = policy(LivenessRule::SelfReported);
        // stale but self-reported online still counts
        assert!(p.evaluate(Some(&record(true, 1)), NOW, true).is_online());
        assert_eq!(
            p.evaluate(Some(&record(false, NOW)), NOW, true),
            ConnectivityState::Disconnected
        );
    }

    #[test]
    fn test_fresh_ignores_flag() {
        let p = policy(LivenessRule::Fresh);
        assert!(p.evaluate(Some(&record(false, NOW)), NOW, true).is_online());
        assert_eq!(
            p.evaluate(Some(&record(true, NOW - 60_000)), NOW, true),
            ConnectivityState::Stale
        );
    }

    #[test]
    fn test_self_reported_and_fresh() {
        let p = policy(LivenessRule::SelfReportedAndFresh);
        assert!(p.evaluate(Some(&record(true, NOW - 1_000)), NOW, true).is_online());
        assert_eq!(
            p.evaluate(Some(&record(true, NOW - 60_000)), NOW, true),
            ConnectivityState::Stale
        );
        assert_eq!(
            p.evaluate(Some(&record(false, NOW)), NOW, true),
            ConnectivityState::Disconnected
        );
        assert_eq!(
            p.evaluate(Some(&record(true, 0)), NOW, true),
            ConnectivityState::Stale
        );
    }

    #[test]
    fn test_broken_subscription_is_degraded() {
        let p = policy(LivenessRule::SelfReported);
        let state = p.evaluate(Some(&record(true, NOW)), NOW, false);
        assert_eq!(state, ConnectivityState::Degraded);
        assert!(!state.is_online());
    }

    #[test]
    fn test_rule_parsing() {
        assert_eq!(
            "self_reported_and_fresh".parse::<LivenessRule>().unwrap(),
            LivenessRule::SelfReportedAndFresh
        );
        assert!("always".parse::<LivenessRule>().is_err());
    }
}
