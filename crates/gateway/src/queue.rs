//! Bounded FIFO of outbound events held while no client is attached.
//!
//! When full, the oldest entry is evicted to make room for the new one.
//! Entries whose delivery keeps failing are dropped after
//! [`MAX_DELIVERY_ATTEMPTS`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use slowhands_core::error::DeliveryError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Failed deliveries after which a queued message is discarded.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub current_size: usize,
    pub max_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
    pub is_full: bool,
    pub is_empty: bool,
}

#[derive(Default)]
struct Inner {
    entries: VecDeque<QueuedMessage>,
    total_enqueued: u64,
    total_dequeued: u64,
    total_dropped: u64,
}

pub struct MessageQueue {
    /// 0 means unbounded
    max_size: usize,
    inner: Mutex<Inner>,
    available: Notify,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn at_capacity(&self, len: usize) -> bool {
        self.max_size > 0 && len >= self.max_size
    }

    /// Append an event, evicting the oldest entry if the queue is full.
    ///
    /// Returns `false` only when no room could be made.
    pub fn enqueue(&self, payload: Value) -> bool {
        let mut inner = self.lock();
        if self.at_capacity(inner.entries.len()) {
            inner.total_dropped += 1;
            if inner.entries.pop_front().is_none() {
                warn!(max_size = self.max_size, "Message queue full, rejecting message");
                return false;
            }
            warn!(
                size = inner.entries.len(),
                dropped = inner.total_dropped,
                "Message queue full, dropped oldest message"
            );
        }
        inner.entries.push_back(QueuedMessage {
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        });
        inner.total_enqueued += 1;
        debug!(size = inner.entries.len(), "Message enqueued");
        drop(inner);

        self.available.notify_one();
        true
    }

    fn pop(&self) -> Option<QueuedMessage> {
        let mut inner = self.lock();
        let entry = inner.entries.pop_front()?;
        inner.total_dequeued += 1;
        Some(entry)
    }

    /// Pop the oldest event, waiting up to `timeout` for one to arrive
    /// (`None` waits indefinitely).
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Value> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.available.notified();
            if let Some(entry) = self.pop() {
                return Some(entry.payload);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Drain the queue in order through `deliver`.
    ///
    /// A failed delivery ends the pass: the message goes back to the head
    /// with its retry count bumped, or is dropped once it has failed
    /// [`MAX_DELIVERY_ATTEMPTS`] times. Returns the number delivered.
    pub async fn process_all<F, Fut>(&self, mut deliver: F) -> usize
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        let mut processed = 0;
        while let Some(mut entry) = self.pop() {
            match deliver(entry.payload.clone()).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    entry.retry_count += 1;
                    self.requeue_failed(entry, &e);
                    break;
                }
            }
        }
        if processed > 0 {
            info!(processed, remaining = self.len(), "Delivered queued messages");
        }
        processed
    }

    fn requeue_failed(&self, entry: QueuedMessage, error: &DeliveryError) {
        let mut inner = self.lock();
        if entry.retry_count >= MAX_DELIVERY_ATTEMPTS {
            inner.total_dropped += 1;
            warn!(
                attempts = entry.retry_count,
                error = %error,
                "Dropping message after repeated delivery failures"
            );
            return;
        }
        if self.at_capacity(inner.entries.len()) {
            // It is the oldest entry, so it is the one eviction would pick.
            inner.total_dropped += 1;
            warn!(error = %error, "Queue refilled during delivery, dropping failed message");
            return;
        }
        warn!(attempt = entry.retry_count, error = %error, "Delivery failed, message requeued");
        inner.entries.push_front(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.at_capacity(self.len())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Payloads currently held, oldest first.
    pub fn peek_all(&self) -> Vec<Value> {
        self.lock().entries.iter().map(|e| e.payload.clone()).collect()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        let len = inner.entries.len();
        QueueStats {
            current_size: len,
            max_size: self.max_size,
            total_enqueued: inner.total_enqueued,
            total_dequeued: inner.total_dequeued,
            total_dropped: inner.total_dropped,
            is_full: self.at_capacity(len),
            is_empty: len == 0,
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
        info!("Message queue cleared");
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(100)
    }
}
