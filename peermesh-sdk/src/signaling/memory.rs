//! In-process, in-memory signaling adapter.
//!
//! Clones share one store, so handing clones of the same adapter to several
//! peers models a shared signaling service. This is also the test substrate:
//! `push_raw` injects arbitrary slots (including malformed ones) and
//! `snapshot` exposes a log for assertions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SignalingError;
use crate::rtc::RtcConfiguration;

use super::{LogKey, SignalingAdapter, SignalingEvent};

struct MemoryShared {
    logs: Mutex<HashMap<LogKey, Vec<serde_json::Value>>>,
    closed: AtomicBool,
    rtc: RtcConfiguration,
}

/// Shared in-memory event log.
#[derive(Clone)]
pub struct MemoryAdapter {
    shared: Arc<MemoryShared>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_rtc_configuration(RtcConfiguration::default())
    }

    pub fn with_rtc_configuration(rtc: RtcConfiguration) -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                logs: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                rtc,
            }),
        }
    }

    /// Append a raw slot, bypassing the typed event model. Lets tests model
    /// foreign or malformed writers sharing the log.
    pub fn push_raw(&self, key: LogKey, slot: serde_json::Value) {
        self.shared.logs.lock().entry(key).or_default().push(slot);
    }

    /// Copy of one log's slots, for assertions.
    pub fn snapshot(&self, key: &LogKey) -> Vec<serde_json::Value> {
        self.shared
            .logs
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of slots currently on one log.
    pub fn log_len(&self, key: &LogKey) -> usize {
        self.shared.logs.lock().get(key).map_or(0, Vec::len)
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingAdapter for MemoryAdapter {
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let slot = serde_json::to_value(&event)
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        self.shared
            .logs
            .lock()
            .entry(event.key())
            .or_default()
            .push(slot);
        Ok(())
    }

    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let logs = self.shared.logs.lock();
        let slots = match logs.get(key) {
            Some(log) if offset_index < log.len() => log[offset_index..].to_vec(),
            _ => Vec::new(),
        };
        Ok(slots)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    fn rtc_configuration(&self) -> RtcConfiguration {
        self.shared.rtc.clone()
    }
}
