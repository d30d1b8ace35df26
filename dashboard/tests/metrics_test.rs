// Kept alone in its own binary: the gauge is process-global and other
// observers would move it concurrently.

use dashboard::channel::{MemoryChannel, SharedStateChannel};
use dashboard::clock::ManualClock;
use dashboard::connectivity::{ConnectivityPolicy, ConnectivityState, LivenessRule};
use dashboard::metrics::DEVICE_ONLINE;
use dashboard::observer::{ObserverConfig, StatusObserver};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_700_000_000_000;

async fn wait_for_gauge(expected: f64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while DEVICE_ONLINE.get() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("gauge never reached expected value");
}

#[tokio::test]
async fn test_online_gauge_follows_observer_not_reads() {
    let channel = Arc::new(MemoryChannel::new());
    let clock = ManualClock::new(T0);
    let observer = StatusObserver::start(
        channel.clone(),
        ObserverConfig {
            key: "pi/status".to_string(),
            policy: ConnectivityPolicy {
                rule: LivenessRule::SelfReportedAndFresh,
                heartbeat_timeout: Duration::from_secs(15),
            },
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        Arc::new(clock.clone()),
    );

    channel
        .write("pi/status", json!({"online": true, "timestamp": T0}))
        .await
        .unwrap();
    wait_for_gauge(1.0).await;

    // a read of a stale record reports it but leaves the gauge alone
    clock.advance(20_000);
    DEVICE_ONLINE.set(1.0);
    assert_eq!(observer.connectivity_state(), ConnectivityState::Stale);
    assert_eq!(DEVICE_ONLINE.get(), 1.0);

    // the observer's own refresh catches up with the clock
    wait_for_gauge(0.0).await;

    channel
        .write("pi/status", json!({"online": true, "timestamp": T0 + 20_000}))
        .await
        .unwrap();
    wait_for_gauge(1.0).await;
    observer.shutdown().await;
}
