//! Non-blocking bar fan-out.
//!
//! Each subscriber gets its own bounded queue. Publishing never blocks: when
//! a subscriber's queue is full the oldest undelivered event is dropped and
//! counted, so one slow strategy cannot stall the ingest pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::BarEvent;

struct SubscriberQueue {
    queue: Mutex<VecDeque<BarEvent>>,
    capacity: usize,
    notify: Notify,
    receiver_gone: AtomicBool,
    source_closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            receiver_gone: AtomicBool::new(false),
            source_closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an event, dropping the oldest on overflow. Returns how many
    /// events were dropped (0 or 1).
    fn push(&self, event: BarEvent) -> u64 {
        let mut queue = self.queue.lock();
        let mut dropped = 0;
        if queue.len() == self.capacity {
            queue.pop_front();
            dropped = 1;
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
        dropped
    }
}

/// Receiving half of one fan-out subscription.
pub struct BarReceiver {
    queue: Arc<SubscriberQueue>,
}

impl BarReceiver {
    /// Receive the next event; `None` once the fan-out is closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<BarEvent> {
        loop {
            // Register for wakeup before checking, so a publish landing
            // between the check and the await is not lost.
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.queue.lock().pop_front() {
                return Some(event);
            }
            if self.queue.source_closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Try to receive without waiting.
    pub fn try_recv(&mut self) -> Option<BarEvent> {
        self.queue.queue.lock().pop_front()
    }

    /// Events dropped for this subscriber because it was too slow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for BarReceiver {
    fn drop(&mut self) {
        self.queue.receiver_gone.store(true, Ordering::SeqCst);
    }
}

/// Broadcast hub for one (venue, symbol, timeframe) stream.
#[derive(Default)]
pub struct BarFanout {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    closed: AtomicBool,
}

impl BarFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber with its own bounded queue.
    pub fn subscribe(&self, capacity: usize) -> BarReceiver {
        let queue = Arc::new(SubscriberQueue::new(capacity));
        if self.closed.load(Ordering::SeqCst) {
            queue.source_closed.store(true, Ordering::SeqCst);
        }
        self.subscribers.lock().push(Arc::clone(&queue));
        BarReceiver { queue }
    }

    /// Deliver an event to every live subscriber. Returns the number of
    /// events dropped across subscribers.
    pub fn publish(&self, event: &BarEvent) -> u64 {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|q| !q.receiver_gone.load(Ordering::SeqCst));
        let mut dropped = 0;
        for queue in subscribers.iter() {
            dropped += queue.push(event.clone());
        }
        dropped
    }

    /// Signal end-of-stream: receivers drain their queues then see `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for queue in self.subscribers.lock().iter() {
            queue.source_closed.store(true, Ordering::SeqCst);
            queue.notify.notify_waiters();
        }
    }

    /// Current live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|q| !q.receiver_gone.load(Ordering::SeqCst));
        subscribers.len()
    }
}
