//! Typed event sources with cancellable subscriptions.
//!
//! Every source is a broadcast channel. Consumers either take a raw receiver
//! or register a handler, which runs on its own task until the returned
//! [`Subscription`] is cancelled or dropped.

use log::warn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct EventSource<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventSource<E> {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Publish to every current subscriber. Events with no listener are dropped.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn receiver(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `handler` for every event emitted after this call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(E) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event subscriber lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

impl<E: Clone + Send + 'static> Default for EventSource<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventSource<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Handle to a running event handler. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to the handler. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn handler_stops_after_cancel() {
        let source = EventSource::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let mut sub = source.subscribe(move |n| seen_clone.lock().unwrap().push(n));

        source.emit(1);
        source.emit(2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        sub.cancel();
        assert!(!sub.is_active());
        source.emit(3);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn dropping_subscription_releases_receiver() {
        let source = EventSource::<u32>::new();
        let sub = source.subscribe(|_| {});
        assert_eq!(source.subscriber_count(), 1);

        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.subscriber_count(), 0);
    }
}
