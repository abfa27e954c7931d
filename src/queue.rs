//! Bounded FIFO shared between a producing task and a draining task.
//!
//! Used for the DataReceiver event FIFO, the asynchronous DataSender queue and
//! the LogSender queue. Pushing never blocks: when the queue is full the oldest
//! entry is discarded and an [`OverflowWarning`] is returned and logged.
//! Popping waits on a [`Notify`] and also wakes every
//! [`QUEUE_WAKE_INTERVAL`](crate::limits::QUEUE_WAKE_INTERVAL) so a waiter
//! re-checks the closed flag even if a notification is lost.
//!
//! Shutdown order is: [`close`](BoundedQueue::close) flips the flag, wakes all
//! waiters, then the owner joins its worker.

use crate::limits::QUEUE_WAKE_INTERVAL;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Reported when a push displaced the oldest queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowWarning {
    /// Queue capacity at the time of the drop.
    pub capacity: usize,
    /// Total entries dropped by this queue so far.
    pub total_dropped: u64,
}

impl std::fmt::Display for OverflowWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queue full at {} entries, dropped oldest ({} dropped in total)",
            self.capacity, self.total_dropped
        )
    }
}

/// Mutex-protected bounded queue with drop-oldest overflow.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    wake_interval: Duration,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` entries (minimum 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            wake_interval: QUEUE_WAKE_INTERVAL,
        }
    }

    /// Appends an entry, dropping the oldest one if the queue is full.
    pub fn push(&self, item: T) -> Option<OverflowWarning> {
        let overflow = {
            let mut items = self.items.lock();
            let overflow = if items.len() >= self.capacity {
                items.pop_front();
                let total_dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                Some(OverflowWarning {
                    capacity: self.capacity,
                    total_dropped,
                })
            } else {
                None
            };
            items.push_back(item);
            overflow
        };
        self.notify.notify_one();
        if let Some(w) = &overflow {
            warn!(queue = self.name, "{}", w);
        }
        overflow
    }

    /// Removes the head without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Waits for the next entry.
    ///
    /// Returns `None` once the queue is closed and empty, so a worker drains
    /// everything pushed before [`close`](Self::close).
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            let _ = tokio::time::timeout(self.wake_interval, self.notify.notified()).await;
        }
    }

    /// Stops the queue and wakes every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Entries dropped by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
