//! In-process event bus with lossy, bounded per-subscriber buffers.
//!
//! Publishers are the engine's state transitions; subscribers are long-poll
//! listeners. Publish never blocks and never fails: a subscriber that
//! cannot keep up loses its oldest events and receives a single
//! [`EventPayload::Overflow`] sentinel carrying the drop count, so the
//! consumer knows it missed data and can re-read the store.
//!
//! The bus is advisory. Losing a subscriber, or every subscriber, does not
//! affect engine correctness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use labtasker_core::QueueId;

use crate::events::{Event, EventFilter, EventPayload};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// The event bus. Cheap to clone; all clones share the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Debug)]
struct BusInner {
    capacity: usize,
    next_event_id: AtomicU64,
    subscribers: Mutex<Vec<SubscriberEntry>>,
}

#[derive(Debug)]
struct SubscriberEntry {
    id: u64,
    queue_id: QueueId,
    filter: EventFilter,
    state: Arc<SubscriberState>,
}

#[derive(Debug)]
struct SubscriberState {
    buffer: Mutex<Buffer>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct Buffer {
    events: VecDeque<Event>,
    dropped: u64,
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                next_event_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publishes an event to every matching subscriber. Non-blocking.
    pub fn publish(&self, queue_id: QueueId, timestamp: DateTime<Utc>, payload: EventPayload) {
        let id = self.inner.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            timestamp,
            queue_id,
            payload,
        };

        let subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned");
        for entry in subscribers.iter() {
            if entry.queue_id != queue_id || !entry.filter.matches(&event.payload) {
                continue;
            }
            let mut buffer = entry.state.buffer.lock().expect("bus buffer lock poisoned");
            if buffer.events.len() >= self.inner.capacity {
                buffer.events.pop_front();
                buffer.dropped += 1;
            }
            buffer.events.push_back(event.clone());
            drop(buffer);
            entry.state.notify.notify_one();
        }
    }

    /// Registers a subscriber scoped to one queue.
    #[must_use]
    pub fn subscribe(&self, queue_id: QueueId, filter: EventFilter) -> Subscription {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
        });

        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .push(SubscriberEntry {
                id,
                queue_id,
                filter,
                state: Arc::clone(&state),
            });

        Subscription {
            id,
            queue_id,
            state,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the number of live subscribers, for tests.
    ///
    /// # Panics
    ///
    /// Panics if the subscriber lock is poisoned.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

/// A handle to a subscriber's buffer. Dropping it unregisters the
/// subscriber from the bus.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue_id: QueueId,
    state: Arc<SubscriberState>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Returns the next buffered event, waiting up to `timeout` for one to
    /// arrive. Returns `None` when the timeout expires with an empty
    /// buffer.
    ///
    /// If events were dropped since the last drain, the first call returns
    /// an [`EventPayload::Overflow`] sentinel before any buffered event.
    pub async fn next_event(&self, timeout: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.pop() {
                return Some(event);
            }
            let notified = self.state.notify.notified();
            // Re-check after registering interest: a publish may have
            // landed between the pop and the notified() call.
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    /// Pops without waiting.
    fn pop(&self) -> Option<Event> {
        let mut buffer = self.state.buffer.lock().expect("bus buffer lock poisoned");
        if buffer.dropped > 0 {
            let dropped = buffer.dropped;
            buffer.dropped = 0;
            // Sentinel ids are not allocated from the bus sequence.
            return Some(Event {
                id: 0,
                timestamp: Utc::now(),
                queue_id: self.queue_id,
                payload: EventPayload::Overflow { dropped },
            });
        }
        buffer.events.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut subscribers) = bus.subscribers.lock() {
                subscribers.retain(|entry| entry.id != self.id);
            }
        }
    }
}
