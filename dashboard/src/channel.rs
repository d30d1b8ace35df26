//! Key-addressed, last-write-wins publish/subscribe store shared by the
//! dashboard and the device.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Current value at the key, `None` when nothing has been written.
    Value(Option<Value>),
    /// The link behind the subscription broke. Further values may never arrive.
    Error(String),
}

/// Stream of changes for one key.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Next event, or `None` once the channel dropped this listener.
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait SharedStateChannel: Send + Sync {
    /// Replaces the value at `key`. Either the whole value lands or nothing does.
    async fn write(&self, key: &str, value: Value) -> Result<()>;

    /// Starts listening on `key`. The first event is the current value
    /// whenever the channel knows it.
    async fn subscribe(&self, key: &str) -> Result<Subscription>;

    /// Stops delivery and releases the listener.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Reads the current value at `key`.
    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let mut subscription = self.subscribe(key).await?;
        let event = subscription.next().await;
        self.unsubscribe(subscription.handle()).await;
        match event {
            Some(ChannelEvent::Value(value)) => Ok(value),
            Some(ChannelEvent::Error(e)) => Err(Error::ChannelSubscription(e)),
            None => Err(Error::ChannelSubscription(format!(
                "subscription to {} closed before first value",
                key
            ))),
        }
    }
}

/// Bookkeeping of live listeners, shared by channel implementations.
#[derive(Debug, Default)]
pub(crate) struct SubscriberRegistry {
    next_id: u64,
    listeners: HashMap<SubscriptionHandle, Listener>,
}

#[derive(Debug)]
struct Listener {
    key: String,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl SubscriberRegistry {
    pub(crate) fn add(&mut self, key: &str) -> Subscription {
        self.next_id += 1;
        let handle = SubscriptionHandle(self.next_id);
        let (tx, events) = mpsc::unbounded_channel();
        self.listeners.insert(
            handle,
            Listener {
                key: key.to_string(),
                tx,
            },
        );
        Subscription { handle, events }
    }

    /// Removes a listener, returning its key.
    pub(crate) fn remove(&mut self, handle: SubscriptionHandle) -> Option<String> {
        self.listeners.remove(&handle).map(|l| l.key)
    }

    pub(crate) fn send_to(&mut self, handle: SubscriptionHandle, event: ChannelEvent) {
        let closed = match self.listeners.get(&handle) {
            Some(listener) => listener.tx.send(event).is_err(),
            None => false,
        };
        if closed {
            self.listeners.remove(&handle);
        }
    }

    /// Delivers `value` to every listener on `key`, dropping listeners whose
    /// receiving side is gone.
    pub(crate) fn publish(&mut self, key: &str, value: Option<Value>) {
        self.listeners.retain(|handle, listener| {
            if listener.key != key {
                return true;
            }
            let delivered = listener.tx.send(ChannelEvent::Value(value.clone())).is_ok();
            if !delivered {
                debug!("Dropping closed listener {} on {}", handle, key);
            }
            delivered
        });
    }

    /// Notifies every listener that the link broke.
    pub(crate) fn broadcast_error(&mut self, reason: &str) {
        self.listeners.retain(|_, listener| {
            listener
                .tx
                .send(ChannelEvent::Error(reason.to_string()))
                .is_ok()
        });
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    pub(crate) fn is_watched(&self, key: &str) -> bool {
        self.listeners.values().any(|l| l.key == key)
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// In-process channel with one slot per key.
///
/// `set_available(false)` simulates an outage: writes and new subscriptions
/// fail and every existing listener receives an error and is dropped.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug)]
struct MemoryInner {
    values: HashMap<String, Value>,
    registry: SubscriberRegistry,
    available: bool,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                values: HashMap::new(),
                registry: SubscriberRegistry::default(),
                available: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_available(&self, available: bool) {
        let mut inner = self.lock();
        inner.available = available;
        if !available {
            warn!("Memory channel going unavailable, dropping {} listeners", inner.registry.len());
            inner.registry.broadcast_error("channel unavailable");
            inner.registry.clear();
        }
    }

    /// Current value at `key`, bypassing availability.
    pub fn current(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().registry.len()
    }
}

#[async_trait]
impl SharedStateChannel for MemoryChannel {
    async fn write(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(Error::ChannelWrite(format!("{}: channel unavailable", key)));
        }
        inner.values.insert(key.to_string(), value.clone());
        inner.registry.publish(key, Some(value));
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<Subscription> {
        let mut inner = self.lock();
        if !inner.available {
            return Err(Error::ChannelSubscription(format!(
                "{}: channel unavailable",
                key
            )));
        }
        let current = inner.values.get(key).cloned();
        let subscription = inner.registry.add(key);
        inner
            .registry
            .send_to(subscription.handle(), ChannelEvent::Value(current));
        Ok(subscription)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().registry.remove(handle);
    }
}
