//! In-memory append-only signal logs.
//!
//! One `Vec` of raw JSON slots per key, FIFO by construction. Appends wake
//! any pull held open by the long-poll hint through a per-key `Notify`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct LogSlot {
    events: Vec<serde_json::Value>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct StoreInner {
    logs: Mutex<HashMap<String, LogSlot>>,
}

/// Shared store of every log the server serves.
#[derive(Clone, Default)]
pub struct SignalStore {
    inner: Arc<StoreInner>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one slot; returns `(index, length)` of the log afterwards.
    pub fn append(&self, key: &str, event: serde_json::Value) -> (usize, usize) {
        let mut logs = self.inner.logs.lock();
        let slot = logs.entry(key.to_string()).or_default();
        let index = slot.events.len();
        slot.events.push(event);
        let length = slot.events.len();
        slot.notify.notify_waiters();
        (index, length)
    }

    /// Slots with index >= `offset`, in append order.
    pub fn read(&self, key: &str, offset: usize) -> Vec<serde_json::Value> {
        let logs = self.inner.logs.lock();
        match logs.get(key) {
            Some(slot) if offset < slot.events.len() => slot.events[offset..].to_vec(),
            _ => Vec::new(),
        }
    }

    /// Like [`read`](Self::read), but holds an empty answer open for up to
    /// `wait`, returning early as soon as an append lands on the key.
    pub async fn read_wait(
        &self,
        key: &str,
        offset: usize,
        wait: Duration,
    ) -> Vec<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notify = {
                let mut logs = self.inner.logs.lock();
                logs.entry(key.to_string()).or_default().notify.clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so an append between the check and
            // the await cannot be missed.
            notified.as_mut().enable();

            let events = self.read(key, offset);
            if !events.is_empty() {
                return events;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Number of distinct logs currently held.
    pub fn log_count(&self) -> usize {
        self.inner.logs.lock().len()
    }
}
