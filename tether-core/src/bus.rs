//! Fan-out of events to independent subscribers.
//!
//! Every published event is wrapped in a single `Arc` and pushed to one
//! unbounded queue per subscriber. Subscribers never share a queue, so each
//! one observes every event exactly once, and all of them observe the same
//! allocation for the same event.
//!
//! Queues are unbounded: a stalled subscriber buffers without limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

pub struct EventBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

struct BusInner<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Arc<T>>>,
    closed: bool,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the event to every current subscriber.
    pub fn publish(&self, event: Arc<T>) {
        let mut inner = self.lock();
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Starts observing events published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Ends every subscription once its queued events are drained.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// A live view of an [`EventBus`]. Dropping it detaches it from the bus.
pub struct Subscription<T> {
    id: u64,
    bus: Weak<Mutex<BusInner<T>>>,
    rx: mpsc::UnboundedReceiver<Arc<T>>,
}

impl<T> Subscription<T> {
    /// Waits for the next event. Returns `None` once the bus is closed and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
    }
}
