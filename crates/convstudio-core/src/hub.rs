//! Broadcast hub with per-subscriber bounded queues
//!
//! Publishing never blocks. A slow subscriber loses its oldest buffered
//! non-terminal events instead of stalling the publisher or other subscribers.

use crate::types::{FileTreeEvent, StreamEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Events carried by an [`EventHub`]
pub trait HubEvent: Clone + Send + Sync + 'static {
    /// Terminal events are never evicted from a full queue
    fn is_terminal(&self) -> bool;
}

impl HubEvent for StreamEvent {
    fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl HubEvent for FileTreeEvent {
    fn is_terminal(&self) -> bool {
        false
    }
}

struct SubscriberQueue<T> {
    buffer: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T: HubEvent> SubscriberQueue<T> {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: T, capacity: usize) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= capacity {
                match buffer.iter().position(|queued| !queued.is_terminal()) {
                    Some(index) => {
                        buffer.remove(index);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    None if !event.is_terminal() => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    None => {}
                }
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct HubInner<T> {
    subscribers: DashMap<u64, Arc<SubscriberQueue<T>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

/// Multi-subscriber broadcast of `T`
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: HubEvent> Default for EventHub<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl<T: HubEvent> EventHub<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new());
        if self.inner.closed.load(Ordering::Acquire) {
            queue.close();
        } else {
            self.inner.subscribers.insert(id, Arc::clone(&queue));
        }
        tracing::debug!("Hub subscriber {} attached", id);
        Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every current subscriber
    pub fn publish(&self, event: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        for entry in self.inner.subscribers.iter() {
            entry.value().push(event.clone(), self.inner.capacity);
        }
    }

    /// Close the hub; subscribers drain their queues and then end
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for entry in self.inner.subscribers.iter() {
            entry.value().close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// Receiving end of an [`EventHub`]; dropping it unsubscribes
pub struct Subscription<T> {
    id: u64,
    queue: Arc<SubscriberQueue<T>>,
    hub: Weak<HubInner<T>>,
}

impl<T: HubEvent> Subscription<T> {
    /// Next event, or `None` once the hub is closed and the queue drained
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let next = self.queue.buffer.lock().pop_front();
            if let Some(event) = next {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.queue.buffer.lock().pop_front()
    }

    /// Events evicted from this subscriber's queue so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.remove(&self.id);
        }
    }
}
