//! The top-level peer handle: one identity, many room memberships.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::id::{PeerId, RoomId};
use crate::room::{Room, RoomMembership};
use crate::rtc::RtcBackend;

/// Construction parameters for a [`Peer`].
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Peer identity; generated when absent.
    pub id: Option<String>,
    /// Heartbeat and polling tuning.
    pub mesh: MeshConfig,
}

impl PeerConfig {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

struct PeerInner {
    id: PeerId,
    backend: Arc<dyn RtcBackend>,
    config: MeshConfig,
    memberships: Mutex<HashMap<RoomId, RoomMembership>>,
    closed: AtomicBool,
}

/// Handle owning a peer identity; factory for room memberships. Cheap to
/// clone; clones share the membership table.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Create a peer. An explicit id must be non-empty; with none supplied a
    /// random one is generated.
    pub fn new(config: PeerConfig, backend: Arc<dyn RtcBackend>) -> Result<Self, MeshError> {
        let id = match config.id {
            Some(id) if id.is_empty() => {
                return Err(MeshError::InvalidArgument(
                    "peer id must be non-empty".to_string(),
                ));
            }
            Some(id) => PeerId::new(id),
            None => PeerId::generate(),
        };
        Ok(Self {
            inner: Arc::new(PeerInner {
                id,
                backend,
                config: config.mesh,
                memberships: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// Join `room`, resolving once the join event is observed back from the
    /// log. Idempotent per room: while a membership is live, joining again
    /// returns the same handle without pushing a second `join`; after a
    /// `leave` a fresh membership is created.
    pub async fn join(&self, room: &Room) -> Result<RoomMembership, MeshError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MeshError::InvalidArgument(
                "peer has been closed".to_string(),
            ));
        }
        let membership = {
            let mut memberships = self.inner.memberships.lock();
            match memberships.get(room.id()) {
                Some(existing) if !existing.has_left() => existing.clone(),
                _ => {
                    let fresh = RoomMembership::new(
                        self.inner.id.clone(),
                        room.clone(),
                        self.inner.backend.clone(),
                        self.inner.config.clone(),
                    );
                    memberships.insert(room.id().clone(), fresh.clone());
                    fresh
                }
            }
        };
        membership.join().await?;
        Ok(membership)
    }

    /// Leave every room this peer is currently in. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let memberships: Vec<_> = self
            .inner
            .memberships
            .lock()
            .drain()
            .map(|(_, membership)| membership)
            .collect();
        for membership in memberships {
            membership.leave().await;
        }
        tracing::debug!(peer = %self.inner.id, "peer closed");
    }
}
