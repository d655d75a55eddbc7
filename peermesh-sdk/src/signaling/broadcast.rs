//! Broadcast-channel signaling adapter.
//!
//! Models an eventually-consistent shared bus inside one process: a
//! [`BroadcastHub`] fans every push out over a `tokio::sync::broadcast`
//! channel, and each [`BroadcastAdapter`] handle runs a subscriber task that
//! appends into its own log replica. A push therefore becomes visible to
//! every handle (the pusher included) only after the broadcast is drained,
//! which is exactly the visibility contract polling loops are written
//! against.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::SignalingError;
use crate::rtc::RtcConfiguration;

use super::{LogKey, SignalingAdapter, SignalingEvent};

#[derive(Clone)]
struct Record {
    key: LogKey,
    slot: serde_json::Value,
}

/// Source of [`BroadcastAdapter`] handles sharing one broadcast channel.
pub struct BroadcastHub {
    tx: broadcast::Sender<Record>,
    rtc: RtcConfiguration,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_rtc_configuration(RtcConfiguration::default())
    }

    pub fn with_rtc_configuration(rtc: RtcConfiguration) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, rtc }
    }

    /// Create a new handle with its own replica of every log.
    pub fn adapter(&self) -> BroadcastAdapter {
        let logs: Arc<Mutex<HashMap<LogKey, Vec<serde_json::Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut rx = self.tx.subscribe();
        let replica = logs.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        replica
                            .lock()
                            .entry(record.key)
                            .or_default()
                            .push(record.slot);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "broadcast adapter replica lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        BroadcastAdapter {
            tx: self.tx.clone(),
            logs,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            rtc: self.rtc.clone(),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's view of the broadcast substrate.
pub struct BroadcastAdapter {
    tx: broadcast::Sender<Record>,
    logs: Arc<Mutex<HashMap<LogKey, Vec<serde_json::Value>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    rtc: RtcConfiguration,
}

#[async_trait]
impl SignalingAdapter for BroadcastAdapter {
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let slot = serde_json::to_value(&event)
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        self.tx
            .send(Record {
                key: event.key(),
                slot,
            })
            .map_err(|_| SignalingError::Transport("broadcast channel has no subscribers".into()))?;
        Ok(())
    }

    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Closed);
        }
        let logs = self.logs.lock();
        let slots = match logs.get(key) {
            Some(log) if offset_index < log.len() => log[offset_index..].to_vec(),
            _ => Vec::new(),
        };
        Ok(slots)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn rtc_configuration(&self) -> RtcConfiguration {
        self.rtc.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{PeerId, RoomId};

    fn join(peer: &str, room: &str) -> SignalingEvent {
        SignalingEvent::Join {
            peer_id: PeerId::from(peer),
            room_id: RoomId::from(room),
        }
    }

    #[tokio::test]
    async fn push_becomes_visible_on_every_handle() {
        let hub = BroadcastHub::new();
        let a = hub.adapter();
        let b = hub.adapter();
        a.push(join("alice", "r")).await.unwrap();

        let key = LogKey::Room(RoomId::from("r"));
        // Visibility is eventual: poll until both replicas drained the event.
        for adapter in [&a, &b] {
            let mut slots = Vec::new();
            for _ in 0..50 {
                slots = adapter.pull(&key, 0).await.unwrap();
                if !slots.is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            assert_eq!(slots.len(), 1);
            assert_eq!(slots[0]["peerId"], "alice");
        }
    }

    #[tokio::test]
    async fn closed_handle_rejects_traffic_but_peers_continue() {
        let hub = BroadcastHub::new();
        let a = hub.adapter();
        let b = hub.adapter();
        a.close().await;
        a.close().await; // idempotent
        assert!(matches!(
            a.push(join("alice", "r")).await,
            Err(SignalingError::Closed)
        ));
        b.push(join("bob", "r")).await.unwrap();
    }
}
