//! Notification fan-out to external subscribers.
//!
//! Every subscriber sees the same notifications in the order they were
//! published. Each subscriber owns a bounded buffer; when it falls behind,
//! the oldest notifications are evicted and the subscriber receives a single
//! [`Notification::Overflow`] in their place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::vm::VmState;

/// Default number of notifications buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Everything the controller reports outward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// The lifecycle state machine moved.
    State { from: VmState, to: VmState },
    /// Human-readable progress, e.g. while starting.
    Status { text: String, progress: Option<u8> },
    /// An asynchronous QMP event such as `STOP`, `RESUME` or `SHUTDOWN`.
    QmpEvent {
        name: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// One line read from the text monitor console.
    MonitorOutput { line: String },
    /// The reply to a human monitor command.
    HumanResponse { text: String },
    /// An operation failed at runtime.
    Failure { operation: String, error: String },
    /// The emulator process exited.
    ProcessExited { code: Option<i32> },
    /// The subscriber fell behind and `dropped` notifications were evicted.
    Overflow { dropped: u64 },
}

impl Notification {
    pub fn status(text: impl Into<String>, progress: Option<u8>) -> Self {
        Notification::Status {
            text: text.into(),
            progress,
        }
    }

    pub fn failure(operation: impl Into<String>, error: impl ToString) -> Self {
        Notification::Failure {
            operation: operation.into(),
            error: error.to_string(),
        }
    }
}

/// Publisher side. Cloning shares the same stream.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<Notification>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventDispatcher {
    /// `capacity` is the per-subscriber buffer size (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Publishing with no subscribers is
    /// not an error.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Subscribe to notifications published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side handed to the presentation layer.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
}

impl Subscription {
    /// Wait for the next notification. Returns `None` once every publisher
    /// has been dropped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.rx.recv().await {
            Ok(n) => Some(n),
            Err(broadcast::error::RecvError::Lagged(dropped)) => Some(overflow(dropped)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Notification> {
        match self.rx.try_recv() {
            Ok(n) => Some(n),
            Err(broadcast::error::TryRecvError::Lagged(dropped)) => Some(overflow(dropped)),
            Err(_) => None,
        }
    }
}

fn overflow(dropped: u64) -> Notification {
    warn!(dropped, "notification subscriber fell behind, oldest notifications evicted");
    Notification::Overflow { dropped }
}
