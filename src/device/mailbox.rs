//! # Sample Mailbox
//!
//! Single-slot, last-value-wins handoff from the capture task to readers,
//! plus a broadcast channel for subscribers that want every sample.
//!
//! The slot has its own lock, separate from the link mutex, so reading the
//! latest sample never waits on serial I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{broadcast, Notify};

#[derive(Debug)]
pub struct Mailbox<T: Clone> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    tx: broadcast::Sender<T>,
    published: AtomicU64,
}

impl<T: Clone> Mailbox<T> {
    /// # Arguments
    ///
    /// * `capacity` - Broadcast backlog per subscriber before it lags
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            tx,
            published: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the slot and wake waiters
    pub fn publish(&self, value: T) {
        *self.lock() = Some(value.clone());
        self.published.fetch_add(1, Ordering::Release);
        self.notify.notify_waiters();
        // No subscribers is fine
        let _ = self.tx.send(value);
    }

    /// Copy of the latest value, leaving it in place
    pub fn latest(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Take the latest value, emptying the slot
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    /// Wait for a value, taking it
    ///
    /// Returns immediately if the slot already holds one.
    pub async fn next(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.take() {
                return value;
            }
            notified.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of values published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}
