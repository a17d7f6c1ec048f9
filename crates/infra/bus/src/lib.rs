//! Fan-out publish/subscribe topics
//!
//! A [`Topic`] delivers every published value to each live [`Receiver`].
//! Each receiver owns a bounded queue; when a slow receiver falls behind the
//! oldest queued value is dropped so publishers never block. A new receiver
//! may ask for the most recently published value to be replayed first.
//! Ordering is FIFO per receiver only.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Topic was closed; no further subscriptions are accepted
    #[error("topic is closed")]
    Closed,
    /// Subscriber queue capacity must be at least one
    #[error("subscriber queue capacity must be non-zero")]
    ZeroCapacity,
}

/// Result alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

struct Slot<T> {
    queue: ArrayQueue<T>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Slot<T> {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct State<T> {
    recent: Option<T>,
    subscribers: Vec<(u64, Arc<Slot<T>>)>,
    next_id: u64,
    closed: bool,
}

/// Multi-subscriber topic with replay of the most recent value
pub struct Topic<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Create an empty topic
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                recent: None,
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    /// Subscribe with a queue of `limit` values
    ///
    /// When `include_recent` is set and a value has been published before,
    /// that value is queued for the new receiver immediately.
    ///
    /// # Errors
    /// Returns [`BusError::ZeroCapacity`] for a zero `limit` and
    /// [`BusError::Closed`] after [`Topic::close`].
    pub fn subscribe(&self, limit: usize, include_recent: bool) -> BusResult<Receiver<T>> {
        if limit == 0 {
            return Err(BusError::ZeroCapacity);
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(BusError::Closed);
        }
        let slot = Arc::new(Slot {
            queue: ArrayQueue::new(limit),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        if include_recent {
            if let Some(value) = &state.recent {
                slot.queue.force_push(value.clone());
            }
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, Arc::clone(&slot)));
        Ok(Receiver {
            id,
            slot,
            topic: Arc::downgrade(&self.state),
        })
    }

    /// Publish a value to every receiver, returning how many got it
    ///
    /// Publishing to a closed topic is a no-op.
    pub fn publish(&self, value: T) -> usize {
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }
        for (_, slot) in &state.subscribers {
            slot.queue.force_push(value.clone());
            slot.notify.notify_one();
        }
        state.recent = Some(value);
        state.subscribers.len()
    }

    /// Most recently published value
    #[must_use]
    pub fn recent(&self) -> Option<T> {
        self.state.lock().recent.clone()
    }

    /// Number of live receivers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Close the topic. Receivers drain what is queued and then end.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, slot) in state.subscribers.drain(..) {
            slot.close();
        }
        debug!("topic closed");
    }

    /// Check if the topic is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Receiving end of one subscription; dropping it unsubscribes
pub struct Receiver<T> {
    id: u64,
    slot: Arc<Slot<T>>,
    topic: Weak<Mutex<State<T>>>,
}

impl<T> Receiver<T> {
    /// Wait for the next value. Returns `None` once the topic is closed and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.slot.queue.pop() {
                return Some(value);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return self.slot.queue.pop();
            }
            self.slot.notify.notified().await;
        }
    }

    /// Take the next value without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.slot.queue.pop()
    }

    /// Whether the topic behind this receiver is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if let Some(state) = self.topic.upgrade() {
            state.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
