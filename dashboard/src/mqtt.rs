//! Shared State Channel over an MQTT broker.
//!
//! Keys are topics and every write is a retained QoS 1 publish, so the broker
//! holds exactly one current value per key and hands it to each new
//! subscriber.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelEvent, SharedStateChannel, SubscriberRegistry, Subscription, SubscriptionHandle};
use crate::errors::{Error, Result};

const REQUEST_CAPACITY: usize = 100;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 10_000;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Brokers send the retained copy right after SUBACK. A topic still silent
/// this long after its SUBACK is empty.
const RETAINED_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
}

#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
    shared: Arc<Mutex<MqttShared>>,
    connected: watch::Receiver<bool>,
    /// One write in flight at a time, so outgoing packet ids pair up with
    /// the waiting writer.
    write_lane: Arc<tokio::sync::Mutex<()>>,
    /// Keeps subscribe requests in the order they were queued.
    subscribe_lane: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct MqttShared {
    registry: SubscriberRegistry,
    /// Last payload seen per watched topic.
    latest: HashMap<String, Option<Value>>,
    acks: AckTracker,
    subacks: SubAckTracker,
}

type AckResult = std::result::Result<(), String>;

struct PendingWrite {
    pkid: Option<u16>,
    tx: oneshot::Sender<AckResult>,
}

/// Pairs the single in-flight write with its packet id and PUBACK.
///
/// Publishes given up on (timeout or lost connection) may still be sent or
/// resent by the client after a reconnect. Those are remembered so their
/// packets are not mistaken for a later write.
#[derive(Default)]
struct AckTracker {
    pending: Option<PendingWrite>,
    abandoned_pkids: HashSet<u16>,
    abandoned_unsent: usize,
}

impl AckTracker {
    fn begin(&mut self) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingWrite { pkid: None, tx });
        rx
    }

    /// Drops a write whose publish never reached the client queue.
    fn cancel(&mut self) {
        self.pending = None;
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if self.abandoned_pkids.contains(&pkid) {
            debug!("Resending abandoned publish {}", pkid);
            return;
        }
        if self.abandoned_unsent > 0 {
            self.abandoned_unsent -= 1;
            self.abandoned_pkids.insert(pkid);
            return;
        }
        match &mut self.pending {
            Some(pending) if pending.pkid.is_none() => pending.pkid = Some(pkid),
            _ => debug!("Outgoing publish {} has no waiting writer", pkid),
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if self.abandoned_pkids.remove(&pkid) {
            return;
        }
        if matches!(&self.pending, Some(p) if p.pkid == Some(pkid)) {
            if let Some(pending) = self.pending.take() {
                let _ = pending.tx.send(Ok(()));
            }
        }
    }

    /// Fails the waiting writer, if any, and remembers its publish.
    fn abandon(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            match pending.pkid {
                Some(pkid) => {
                    self.abandoned_pkids.insert(pkid);
                }
                None => self.abandoned_unsent += 1,
            }
            let _ = pending.tx.send(Err(reason.to_string()));
        }
    }
}

/// Maps SUBSCRIBE packet ids back to topics so a SUBACK can settle them.
#[derive(Default)]
struct SubAckTracker {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
    orphaned: usize,
}

impl SubAckTracker {
    fn queue(&mut self, topic: &str) {
        self.queued.push_back(topic.to_string());
    }

    /// Forgets the most recent queue entry when the request never made it
    /// to the client.
    fn unqueue(&mut self) {
        self.queued.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if self.orphaned > 0 {
            self.orphaned -= 1;
            return;
        }
        if let Some(topic) = self.queued.pop_front() {
            self.in_flight.insert(pkid, topic);
        }
    }

    fn on_suback(&mut self, pkid: u16) -> Option<String> {
        self.in_flight.remove(&pkid)
    }

    /// Requests still queued in the client go out after a reconnect with
    /// nobody waiting on them.
    fn reset(&mut self) {
        self.orphaned += self.queued.len();
        self.queued.clear();
        self.in_flight.clear();
    }
}

impl MqttChannel {
    /// Creates the client and spawns the task driving its event loop.
    pub fn connect(settings: &MqttSettings) -> (Self, JoinHandle<()>) {
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            settings.broker, settings.port, settings.client_id
        );

        let mut mqtt_options =
            MqttOptions::new(&settings.client_id, &settings.broker, settings.port);
        mqtt_options.set_keep_alive(settings.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let shared = Arc::new(Mutex::new(MqttShared::default()));
        let (connected_tx, connected) = watch::channel(false);

        let handle = tokio::spawn(run_event_loop(eventloop, Arc::clone(&shared), connected_tx));

        (
            Self {
                client,
                shared,
                connected,
                write_lane: Arc::new(tokio::sync::Mutex::new(())),
                subscribe_lane: Arc::new(tokio::sync::Mutex::new(())),
            },
            handle,
        )
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits until the broker accepted the connection or `timeout` elapsed.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|c| *c))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, MqttShared> {
        lock_shared(&self.shared)
    }
}

fn lock_shared(shared: &Mutex<MqttShared>) -> MutexGuard<'_, MqttShared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SharedStateChannel for MqttChannel {
    /// Publishes a retained QoS 1 message and waits for the broker's PUBACK.
    async fn write(&self, key: &str, value: Value) -> Result<()> {
        let payload = serde_json::to_vec(&value)?;
        let _lane = self.write_lane.lock().await;
        if !self.is_connected() {
            return Err(Error::ChannelWrite(format!("{}: not connected to broker", key)));
        }

        let ack = self.lock().acks.begin();
        if let Err(e) = self.client.publish(key, QoS::AtLeastOnce, true, payload).await {
            self.lock().acks.cancel();
            return Err(Error::ChannelWrite(format!("{}: {}", key, e)));
        }

        match tokio::time::timeout(WRITE_TIMEOUT, ack).await {
            Ok(Ok(Ok(()))) => {
                debug!("Broker acknowledged retained value on {}", key);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(Error::ChannelWrite(format!("{}: {}", key, reason))),
            Ok(Err(_)) => Err(Error::ChannelWrite(format!(
                "{}: acknowledgement dropped",
                key
            ))),
            Err(_) => {
                self.lock().acks.abandon("timed out");
                Err(Error::ChannelWrite(format!(
                    "{}: not acknowledged within {:?}",
                    key, WRITE_TIMEOUT
                )))
            }
        }
    }

    /// Registers a listener and subscribes on the broker. The last payload
    /// already seen on the topic is delivered first. Otherwise the broker's
    /// retained copy follows the SUBACK, or `None` when there is none.
    async fn subscribe(&self, key: &str) -> Result<Subscription> {
        let _lane = self.subscribe_lane.lock().await;
        if !self.is_connected() {
            return Err(Error::ChannelSubscription(format!(
                "{}: not connected to broker",
                key
            )));
        }

        let subscription = {
            let mut shared = self.lock();
            let subscription = shared.registry.add(key);
            if let Some(latest) = shared.latest.get(key).cloned() {
                shared
                    .registry
                    .send_to(subscription.handle(), ChannelEvent::Value(latest));
            }
            shared.subacks.queue(key);
            subscription
        };

        if let Err(e) = self.client.subscribe(key, QoS::AtLeastOnce).await {
            let mut shared = self.lock();
            shared.subacks.unqueue();
            shared.registry.remove(subscription.handle());
            return Err(Error::ChannelSubscription(format!("{}: {}", key, e)));
        }
        info!("Subscribed to {} with QoS 1", key);
        Ok(subscription)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let orphaned = {
            let mut shared = self.lock();
            match shared.registry.remove(handle) {
                Some(key) if !shared.registry.is_watched(&key) => {
                    shared.latest.remove(&key);
                    Some(key)
                }
                _ => None,
            }
        };

        if let Some(key) = orphaned {
            if self.is_connected() {
                if let Err(e) = self.client.unsubscribe(&key).await {
                    warn!("Failed to unsubscribe from {}: {}", key, e);
                }
            }
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Mutex<MqttShared>>,
    connected_tx: watch::Sender<bool>,
) {
    let mut backoff = Backoff::new(
        Duration::from_millis(INITIAL_BACKOFF_MS),
        Duration::from_millis(MAX_BACKOFF_MS),
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                backoff.reset();
                connected_tx.send_replace(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                let value = decode_payload(&publish.payload);
                let mut shared = lock_shared(&shared);
                if shared.registry.is_watched(&publish.topic) {
                    shared.latest.insert(publish.topic.clone(), value.clone());
                    shared.registry.publish(&publish.topic, value);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock_shared(&shared).acks.on_puback(ack.pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let topic = lock_shared(&shared).subacks.on_suback(ack.pkid);
                let Some(topic) = topic else { continue };
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!("Broker refused subscription to {}", topic);
                    continue;
                }
                tokio::spawn(settle_empty_topic(Arc::clone(&shared), topic));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock_shared(&shared).acks.on_outgoing(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock_shared(&shared).subacks.on_outgoing(pkid);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
                connection_lost(&shared, &connected_tx, "broker disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                connection_lost(&shared, &connected_tx, &e.to_string());

                // rumqttc reconnects on the next poll
                let delay = backoff.next_delay();
                debug!("Reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Tells listeners on `topic` that it holds no value, unless a retained copy
/// turned up after the SUBACK.
async fn settle_empty_topic(shared: Arc<Mutex<MqttShared>>, topic: String) {
    tokio::time::sleep(RETAINED_GRACE).await;
    let mut shared = lock_shared(&shared);
    if shared.registry.is_watched(&topic) && !shared.latest.contains_key(&topic) {
        debug!("No retained value on {}", topic);
        shared.latest.insert(topic.clone(), None);
        shared.registry.publish(&topic, None);
    }
}

/// Breaks every listener so consumers re-arm their subscriptions once the
/// connection is back, and fails the write waiting for its PUBACK.
fn connection_lost(shared: &Mutex<MqttShared>, connected_tx: &watch::Sender<bool>, reason: &str) {
    connected_tx.send_replace(false);
    let mut shared = lock_shared(shared);
    shared.acks.abandon(reason);
    shared.subacks.reset();
    shared.registry.broadcast_error(reason);
    shared.registry.clear();
    shared.latest.clear();
}

/// An empty retained payload means the value was cleared. Bytes that are
/// not JSON are passed on as a string so the consumer can reject them.
fn decode_payload(payload: &[u8]) -> Option<Value> {
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Payload is not JSON: {}", e);
            Some(Value::String(String::from_utf8_lossy(payload).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_empty_payload_is_cleared() {
        assert_eq!(decode_payload(b""), None);
    }

    #[test]
    fn test_decode_json_payload() {
        assert_eq!(
            decode_payload(br#"{"online":true}"#),
            Some(json!({"online": true}))
        );
    }

    #[test]
    fn test_decode_invalid_json_kept_as_string() {
        assert_eq!(decode_payload(b"not json"), Some(json!("not json")));
    }

    #[test]
    fn test_write_settles_on_matching_puback() {
        let mut acks = AckTracker::default();
        let mut ack = acks.begin();
        acks.on_outgoing(7);
        acks.on_puback(6);
        assert!(ack.try_recv().is_err());

        acks.on_puback(7);
        assert_eq!(ack.try_recv().unwrap(), Ok(()));
        assert!(acks.pending.is_none());
    }

    #[test]
    fn test_connection_loss_fails_waiting_write() {
        let mut acks = AckTracker::default();
        let mut ack = acks.begin();
        acks.on_outgoing(3);
        acks.abandon("connection reset");
        assert_eq!(ack.try_recv().unwrap(), Err("connection reset".to_string()));

        // the client resends 3 after reconnecting; it must not settle the next write
        let mut next = acks.begin();
        acks.on_outgoing(3);
        acks.on_puback(3);
        assert!(next.try_recv().is_err());

        acks.on_outgoing(4);
        acks.on_puback(4);
        assert_eq!(next.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_unsent_abandoned_publish_is_skipped() {
        let mut acks = AckTracker::default();
        let mut ack = acks.begin();
        acks.abandon("timed out");
        assert!(ack.try_recv().unwrap().is_err());

        let mut next = acks.begin();
        // the stale request finally leaves the queue ahead of the new one
        acks.on_outgoing(1);
        acks.on_outgoing(2);
        acks.on_puback(1);
        assert!(next.try_recv().is_err());
        acks.on_puback(2);
        assert_eq!(next.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_suback_maps_back_to_topic() {
        let mut subacks = SubAckTracker::default();
        subacks.queue("pi/status");
        subacks.queue("pi/commands");
        subacks.on_outgoing(1);
        subacks.on_outgoing(2);
        assert_eq!(subacks.on_suback(2), Some("pi/commands".to_string()));
        assert_eq!(subacks.on_suback(1), Some("pi/status".to_string()));
        assert_eq!(subacks.on_suback(1), None);

        subacks.queue("pi/status");
        subacks.reset();
        subacks.queue("pi/status");
        subacks.on_outgoing(5);
        subacks.on_outgoing(6);
        assert_eq!(subacks.on_suback(5), None);
        assert_eq!(subacks.on_suback(6), Some("pi/status".to_string()));
    }

    #[tokio::test]
    async fn test_write_rejected_while_disconnected() {
        let settings = MqttSettings {
            // nothing listens here
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: "dashboard-test".to_string(),
            keep_alive: Duration::from_secs(5),
        };
        let (channel, handle) = MqttChannel::connect(&settings);

        let err = channel
            .write("pi/commands", json!({"command": "restart", "timestamp": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelWrite(_)));
        assert!(matches!(
            channel.subscribe("pi/status").await,
            Err(Error::ChannelSubscription(_))
        ));
        handle.abort();
    }

    #[tokio::test]
    #[ignore]
    async fn test_retained_round_trip_against_local_broker() {
        let settings = MqttSettings {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: format!("dashboard-test-{}", uuid::Uuid::new_v4()),
            keep_alive: Duration::from_secs(5),
        };
        let (channel, handle) = MqttChannel::connect(&settings);
        assert!(channel.wait_connected(Duration::from_secs(5)).await);

        let topic = format!("test/{}", uuid::Uuid::new_v4());
        channel.write(&topic, json!({"online": true})).await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), channel.read(&topic))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(json!({"online": true})));

        // clear the retained message again
        channel
            .client
            .publish(&topic, QoS::AtLeastOnce, true, Vec::new())
            .await
            .unwrap();
        handle.abort();
    }

    #[tokio::test]
    #[ignore]
    async fn test_read_of_empty_topic_yields_none() {
        let settings = MqttSettings {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: format!("dashboard-test-{}", uuid::Uuid::new_v4()),
            keep_alive: Duration::from_secs(5),
        };
        let (channel, handle) = MqttChannel::connect(&settings);
        assert!(channel.wait_connected(Duration::from_secs(5)).await);

        let topic = format!("test/{}", uuid::Uuid::new_v4());
        let value = tokio::time::timeout(Duration::from_secs(5), channel.read(&topic))
            .await
            .expect("read of an empty topic never resolved")
            .unwrap();
        assert_eq!(value, None);
        handle.abort();
    }
}
