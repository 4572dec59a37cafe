//! Signal relay boundary.
//!
//! The relay is an external pub/sub broker: a publish inserts one row, and
//! every subscription whose filter matches receives it. Ordering is only
//! guaranteed among the rows of a single sender.

use async_trait::async_trait;
use chatify_core::signaling::{SignalRow, SignalingMessage};
use chatify_core::types::{CallIntent, ChannelKey, UserId};
use dashmap::DashMap;
use futures_util::Stream;
use log::{debug, trace};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::error::RelayError;

/// Which rows a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFilter {
    pub receiver: UserId,
    pub sender: Option<UserId>,
    pub channel: Option<ChannelKey>,
}

impl SignalFilter {
    /// Everything addressed to `receiver`, from anyone.
    pub fn addressed_to(receiver: UserId) -> Self {
        Self {
            receiver,
            sender: None,
            channel: None,
        }
    }

    /// Messages from the remote participant of `intent` to its local one,
    /// scoped to the pair's channel.
    pub fn for_call(intent: &CallIntent) -> Self {
        Self {
            receiver: intent.local_id.clone(),
            sender: Some(intent.remote_id.clone()),
            channel: Some(intent.channel_key()),
        }
    }

    pub fn matches(&self, msg: &SignalingMessage) -> bool {
        if msg.to_id != self.receiver {
            return false;
        }
        if let Some(sender) = &self.sender
            && &msg.from_id != sender
        {
            return false;
        }
        if let Some(channel) = &self.channel
            && *channel != ChannelKey::new(&msg.from_id, &msg.to_id)
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Insert one message. No retries.
    async fn publish(&self, msg: &SignalingMessage) -> Result<(), RelayError>;

    /// Open a subscription. Messages flow until the stream is cancelled or dropped.
    async fn subscribe(&self, filter: SignalFilter) -> Result<SignalStream, RelayError>;
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Live subscription to a relay.
///
/// Yields messages in delivery order. It ends only when the relay side drops
/// the listener. Cancelling (or dropping) it unregisters the listener.
pub struct SignalStream {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    on_cancel: Option<CancelFn>,
}

impl SignalStream {
    /// Build a stream over `rx`. `on_cancel` runs once when the stream is
    /// cancelled or dropped.
    pub fn new(
        rx: mpsc::UnboundedReceiver<SignalingMessage>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(f) = self.on_cancel.take() {
            f();
        }
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.on_cancel.is_none()
    }
}

impl Stream for SignalStream {
    type Item = SignalingMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SignalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalStream")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Listener {
    filter: SignalFilter,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct RelayInner {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    published: Mutex<Vec<SignalRow>>,
}

/// In-process broker with the same contract as the hosted relay.
///
/// Every published message goes through the stored row encoding, so
/// subscribers see exactly what a remote peer would parse.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    inner: Arc<RelayInner>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish and subscribe fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Rows accepted so far, in publish order.
    pub fn published(&self) -> Vec<SignalRow> {
        match self.inner.published.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Deliver a raw row as if another client had inserted it.
    pub fn insert_row(&self, row: SignalRow) {
        match self.inner.published.lock() {
            Ok(mut log) => log.push(row.clone()),
            Err(poisoned) => poisoned.into_inner().push(row.clone()),
        }

        let msg = match SignalingMessage::from_row(&row) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed signal row from {}: {}", row.caller_id, e);
                return;
            }
        };

        let mut closed = Vec::new();
        for entry in self.inner.listeners.iter() {
            if entry.filter.matches(&msg) && entry.tx.send(msg.clone()).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.inner.listeners.remove(&id);
        }
    }

    fn check_available(&self) -> Result<(), RelayError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::Unavailable("relay offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalRelay for InMemoryRelay {
    async fn publish(&self, msg: &SignalingMessage) -> Result<(), RelayError> {
        self.check_available()?;
        let row = msg
            .to_row()
            .map_err(|e| RelayError::Unavailable(format!("encode failed: {e}")))?;
        trace!("relay <- {} {} -> {}", msg.kind, msg.from_id, msg.to_id);
        self.insert_row(row);
        Ok(())
    }

    async fn subscribe(&self, filter: SignalFilter) -> Result<SignalStream, RelayError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Listener { filter, tx });

        let weak: Weak<RelayInner> = Arc::downgrade(&self.inner);
        Ok(SignalStream::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(&id);
            }
        }))
    }
}
