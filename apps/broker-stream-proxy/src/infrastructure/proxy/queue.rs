//! Per-Client Outbound Queue
//!
//! Bounded FIFO of ticks waiting to be written to one client. When full,
//! the oldest queued tick of the incoming tick's topic is dropped so that
//! each topic converges on its newest value. If the incoming topic has
//! nothing queued, the oldest tick overall is dropped instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::tick::Topic;
use crate::infrastructure::bus::BusEnvelope;

/// Bounded drop-oldest tick queue.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    items: VecDeque<BusEnvelope>,
}

impl OutboundQueue {
    /// Queue holding at most `capacity` ticks (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Enqueue, returning the tick evicted to make room.
    pub fn push(&mut self, envelope: BusEnvelope) -> Option<BusEnvelope> {
        let evicted = if self.items.len() >= self.capacity {
            let same_topic = self
                .items
                .iter()
                .position(|queued| queued.topic == envelope.topic);
            match same_topic {
                Some(index) => self.items.remove(index),
                None => self.items.pop_front(),
            }
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Oldest queued tick.
    pub fn pop(&mut self) -> Option<BusEnvelope> {
        self.items.pop_front()
    }

    /// Discard everything queued for `topic`; returns how many.
    pub fn purge_topic(&mut self, topic: &Topic) -> usize {
        let before = self.items.len();
        self.items.retain(|queued| &queued.topic != topic);
        before - self.items.len()
    }

    /// Ticks waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// [`OutboundQueue`] shared between a session's reader and writer.
#[derive(Debug)]
pub struct SharedQueue {
    queue: Mutex<OutboundQueue>,
    ready: Notify,
    dropped: AtomicU64,
}

impl SharedQueue {
    /// Shared queue with the given bound.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(OutboundQueue::new(capacity)),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue and wake the writer. Returns true if a tick was dropped.
    pub fn push(&self, envelope: BusEnvelope) -> bool {
        let evicted = self.queue.lock().push(envelope);
        self.ready.notify_one();
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Oldest queued tick, without waiting.
    pub fn pop(&self) -> Option<BusEnvelope> {
        self.queue.lock().pop()
    }

    /// Wait until something is pushed.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Discard queued ticks for `topic`.
    pub fn purge_topic(&self, topic: &Topic) -> usize {
        self.queue.lock().purge_topic(topic)
    }

    /// Ticks dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ticks waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
