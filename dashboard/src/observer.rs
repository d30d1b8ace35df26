//! Status Observer: keeps the latest status record from the channel and
//! derives connectivity from it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelEvent, SharedStateChannel};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityPolicy, ConnectivityState};
use crate::metrics::{
    DEVICE_ONLINE, MALFORMED_RECORDS_TOTAL, RESUBSCRIPTIONS_TOTAL, STATUS_UPDATES_TOTAL,
    SUBSCRIPTION_ERRORS_TOTAL,
};
use crate::model::StatusRecord;
use crate::validate::sanitize_status;

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub key: String,
    pub policy: ConnectivityPolicy,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            key: "pi/status".to_string(),
            policy: ConnectivityPolicy::default(),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// What the observer currently knows.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub record: Option<StatusRecord>,
    /// False while the status subscription is broken and being re-armed.
    pub subscription_healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

pub struct StatusObserver {
    snapshot: watch::Receiver<StatusSnapshot>,
    policy: ConnectivityPolicy,
    clock: Arc<dyn Clock>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_listener: AtomicU64,
    listeners: Mutex<HashMap<ObserverHandle, JoinHandle<()>>>,
}

impl StatusObserver {
    /// Starts watching the status key. Must be called inside a Tokio runtime.
    pub fn start(
        channel: Arc<dyn SharedStateChannel>,
        config: ObserverConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(StatusSnapshot {
            record: None,
            subscription_healthy: true,
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let policy = config.policy;
        let task = tokio::spawn(run_observer(
            channel,
            config,
            Arc::clone(&clock),
            snapshot_tx,
            stop_rx,
        ));

        Self {
            snapshot,
            policy,
            clock,
            stop_tx,
            task: Mutex::new(Some(task)),
            next_listener: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn latest_status(&self) -> Option<StatusRecord> {
        self.snapshot.borrow().record.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        let snapshot = self.snapshot.borrow();
        self.policy.evaluate(
            snapshot.record.as_ref(),
            self.clock.now_millis(),
            snapshot.subscription_healthy,
        )
    }

    pub fn connectivity(&self) -> bool {
        self.connectivity_state().is_online()
    }

    /// Receiver that is notified on every applied record and health change.
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.clone()
    }

    /// Registers `callback`, which is called with the current record right
    /// away and again with the newest record after every change.
    pub fn subscribe<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(Option<StatusRecord>) + Send + 'static,
    {
        let handle = ObserverHandle(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.snapshot.clone();
        let task = tokio::spawn(async move {
            let mut last = rx.borrow_and_update().record.clone();
            callback(last.clone());
            while rx.changed().await.is_ok() {
                let record = rx.borrow_and_update().record.clone();
                // health flips alone don't count as a new record
                if record != last {
                    callback(record.clone());
                    last = record;
                }
            }
        });

        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, task);
        handle
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) {
        let task = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Stops the observer and releases its channel listener. Later calls
    /// are no-ops.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Status observer task ended abnormally: {}", e);
            }
        }
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in listeners {
            task.abort();
        }
    }
}

async fn run_observer(
    channel: Arc<dyn SharedStateChannel>,
    config: ObserverConfig,
    clock: Arc<dyn Clock>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    // records age without new deliveries, so the gauge is re-evaluated on a timer
    let mut gauge_refresh = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
    gauge_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Starting status observer on {}", config.key);

    loop {
        let subscribed = tokio::select! {
            _ = stop_rx.changed() => break,
            result = channel.subscribe(&config.key) => result,
        };

        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                SUBSCRIPTION_ERRORS_TOTAL.inc();
                warn!("Failed to subscribe to {}: {}", config.key, e);
                mark_degraded(&snapshot_tx);
                if wait_or_stop(&mut backoff, &mut stop_rx).await {
                    break;
                }
                continue;
            }
        };

        if backoff.attempt() > 0 {
            RESUBSCRIPTIONS_TOTAL.inc();
            info!(
                "Re-subscribed to {} after {} attempts",
                config.key,
                backoff.attempt()
            );
        }
        backoff.reset();
        let handle = subscription.handle();

        let stopped = loop {
            tokio::select! {
                _ = stop_rx.changed() => break true,
                _ = gauge_refresh.tick() => {
                    refresh_online_gauge(&snapshot_tx, &config.policy, clock.as_ref());
                }
                event = subscription.next() => match event {
                    Some(ChannelEvent::Value(value)) => {
                        apply_value(&snapshot_tx, value, &config, clock.as_ref());
                    }
                    Some(ChannelEvent::Error(e)) => {
                        warn!("Status subscription on {} failed: {}", config.key, e);
                        break false;
                    }
                    None => {
                        warn!("Status subscription on {} closed by channel", config.key);
                        break false;
                    }
                },
            }
        };

        channel.unsubscribe(handle).await;
        if stopped {
            break;
        }

        SUBSCRIPTION_ERRORS_TOTAL.inc();
        mark_degraded(&snapshot_tx);
        if wait_or_stop(&mut backoff, &mut stop_rx).await {
            break;
        }
    }

    info!("Status observer on {} stopped", config.key);
}

/// Sleeps for the next backoff delay. Returns true if asked to stop meanwhile.
async fn wait_or_stop(backoff: &mut Backoff, stop_rx: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    debug!("Re-subscribing in {:?} (attempt {})", delay, backoff.attempt());
    tokio::select! {
        _ = stop_rx.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn mark_degraded(snapshot_tx: &watch::Sender<StatusSnapshot>) {
    snapshot_tx.send_if_modified(|snapshot| {
        let changed = snapshot.subscription_healthy;
        snapshot.subscription_healthy = false;
        changed
    });
    DEVICE_ONLINE.set(0.0);
}

/// Recomputes the online gauge from the current snapshot.
fn refresh_online_gauge(
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    policy: &ConnectivityPolicy,
    clock: &dyn Clock,
) -> ConnectivityState {
    let snapshot = snapshot_tx.borrow();
    let state = policy.evaluate(
        snapshot.record.as_ref(),
        clock.now_millis(),
        snapshot.subscription_healthy,
    );
    DEVICE_ONLINE.set(if state.is_online() { 1.0 } else { 0.0 });
    state
}

fn apply_value(
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    value: Option<Value>,
    config: &ObserverConfig,
    clock: &dyn Clock,
) {
    // every delivered value replaces the cell, unusable ones as an all-default record
    let record = value.map(|value| {
        sanitize_status(&value).unwrap_or_else(|e| {
            MALFORMED_RECORDS_TOTAL.inc();
            warn!("Unusable status payload on {}: {}", config.key, e);
            StatusRecord::default()
        })
    });

    snapshot_tx.send_modify(|snapshot| {
        if let (Some(previous), Some(next)) = (&snapshot.record, &record) {
            if next.timestamp > 0 && next.timestamp < previous.timestamp {
                warn!(
                    "Status timestamp went backwards ({} -> {})",
                    previous.timestamp, next.timestamp
                );
            }
        }
        snapshot.record = record;
        snapshot.subscription_healthy = true;
    });

    STATUS_UPDATES_TOTAL.inc();
    let state = refresh_online_gauge(snapshot_tx, &config.policy, clock);
    debug!("Applied status record, connectivity {:?}", state);
}
