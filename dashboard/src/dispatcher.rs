//! Command Dispatcher: writes operator commands to the command key.
//!
//! Delivery is fire-and-forget. A successful dispatch means the channel
//! accepted the record, not that the device acted on it. Every dispatch
//! overwrites the single command slot, so concurrent operators race and
//! the last write wins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::channel::SharedStateChannel;
use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_DISPATCHED_TOTAL, COMMAND_FAILURES_TOTAL, DISPATCH_LATENCY_SECONDS};
use crate::model::{CommandKind, CommandRecord, DispatchState};

pub struct CommandDispatcher {
    inner: Arc<DispatchInner>,
    clock: Arc<dyn Clock>,
}

struct DispatchInner {
    channel: Arc<dyn SharedStateChannel>,
    key: String,
    in_flight: AtomicUsize,
    state_tx: watch::Sender<DispatchState>,
}

impl CommandDispatcher {
    pub fn new(
        channel: Arc<dyn SharedStateChannel>,
        key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(DispatchState::Idle);
        Self {
            inner: Arc::new(DispatchInner {
                channel,
                key: key.into(),
                in_flight: AtomicUsize::new(0),
                state_tx,
            }),
            clock,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<DispatchState> {
        self.inner.state_tx.subscribe()
    }

    /// Writes `{command, timestamp: now}` to the command key.
    ///
    /// Overlapping calls are allowed. The write runs on its own task, so it
    /// completes even if the caller stops waiting.
    pub async fn dispatch(&self, command: CommandKind) -> Result<CommandRecord> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.send(command).await
    }

    /// Like `dispatch`, but refuses to start while another dispatch is sending.
    pub async fn try_dispatch(&self, command: CommandKind) -> Result<CommandRecord> {
        if self
            .inner
            .in_flight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rejecting {} while another dispatch is in flight", command);
            return Err(Error::DispatchInFlight);
        }
        self.send(command).await
    }

    async fn send(&self, command: CommandKind) -> Result<CommandRecord> {
        let record = CommandRecord {
            command,
            timestamp: self.clock.now_millis(),
        };
        self.inner.state_tx.send_replace(DispatchState::Sending);

        let inner = Arc::clone(&self.inner);
        let start = Instant::now();
        let write = tokio::spawn(async move {
            let result = match serde_json::to_value(record) {
                Ok(value) => inner.channel.write(&inner.key, value).await,
                Err(e) => Err(Error::Json(e)),
            };
            inner.finish(&record, &result, start);
            result
        });

        match write.await {
            Ok(result) => result.map(|()| record),
            Err(e) => {
                // the task died before settling, so release its slot here
                error!("Dispatch task for {} failed: {}", command, e);
                let result = Err(Error::ChannelWrite(format!("dispatch task failed: {}", e)));
                self.inner.finish(&record, &result, start);
                result.map(|()| record)
            }
        }
    }
}

impl DispatchInner {
    fn finish(&self, record: &CommandRecord, result: &Result<()>, start: Instant) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        match result {
            Ok(()) => {
                DISPATCH_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                COMMANDS_DISPATCHED_TOTAL
                    .with_label_values(&[record.command.as_str()])
                    .inc();
                info!(
                    "Command {} written to {} (timestamp {})",
                    record.command, self.key, record.timestamp
                );
                if remaining == 0 {
                    self.state_tx.send_replace(DispatchState::Idle);
                }
            }
            Err(e) => {
                COMMAND_FAILURES_TOTAL.inc();
                error!("Failed to write command {} to {}: {}", record.command, self.key, e);
                self.state_tx
                    .send_replace(DispatchState::Failed(e.to_string()));
            }
        }
    }
}
