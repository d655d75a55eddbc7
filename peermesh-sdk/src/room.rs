//! Rooms and room memberships.
//!
//! A [`Room`] is a value: a name plus the signaling adapter serving its log.
//! All runtime state lives in the [`RoomMembership`] a peer gets back from
//! [`crate::peer::Peer::join`]: the heartbeat loop proving presence, the room
//! pull loop discovering remotes, and the arena of live [`PeerSession`]s
//! keyed by remote peer id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::channel::ChannelPair;
use crate::config::{MeshConfig, PollBackoff};
use crate::error::MeshError;
use crate::id::{PeerId, RoomId};
use crate::rtc::{ConnectionState, DataChannelState, RtcBackend};
use crate::session::PeerSession;
use crate::signaling::{
    self, LogKey, PresenceKind, SignalingAdapter, SignalingEvent,
};

/// A named meeting point: identity plus the adapter serving its logs.
/// Value object; equality is by room id.
#[derive(Clone)]
pub struct Room {
    id: RoomId,
    adapter: Arc<dyn SignalingAdapter>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>, adapter: Arc<dyn SignalingAdapter>) -> Self {
        Self {
            id: id.into(),
            adapter,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn adapter(&self) -> &Arc<dyn SignalingAdapter> {
        &self.adapter
    }
}

impl PartialEq for Room {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Room {}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("id", &self.id).finish()
    }
}

/// A presence change observed on the room log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub peer: PeerId,
    pub kind: PresenceKind,
}

/// An application payload delivered by a ready peer session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Data-channel lifecycle surfaced per remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChannelUpdate {
    pub peer: PeerId,
    pub state: DataChannelState,
}

/// Peer-connection lifecycle surfaced per remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub peer: PeerId,
    pub state: ConnectionState,
}

/// A session-fatal failure, annotated with the remote peer it concerns.
#[derive(Clone, Debug)]
pub struct SessionFault {
    pub peer: PeerId,
    pub detail: String,
}

/// Event families a membership surfaces to the application.
pub struct RoomEvents {
    pub presence: EventBus<PresenceUpdate>,
    pub message: EventBus<IncomingMessage>,
    pub received_signal: EventBus<SignalingEvent>,
    pub sent_signal: EventBus<SignalingEvent>,
    pub data_channel: EventBus<DataChannelUpdate>,
    pub peer_connection: EventBus<ConnectionUpdate>,
    pub error: EventBus<SessionFault>,
    /// Pinged on every session state change; backs `wait_for_any_ready`.
    pub(crate) ready: Notify,
}

impl Default for RoomEvents {
    fn default() -> Self {
        Self {
            presence: EventBus::new(),
            message: EventBus::new(),
            received_signal: EventBus::new(),
            sent_signal: EventBus::new(),
            data_channel: EventBus::new(),
            peer_connection: EventBus::new(),
            error: EventBus::new(),
            ready: Notify::new(),
        }
    }
}

struct MembershipInner {
    local: PeerId,
    room: Room,
    backend: Arc<dyn RtcBackend>,
    config: MeshConfig,
    events: Arc<RoomEvents>,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    presence: Mutex<HashMap<PeerId, PresenceKind>>,
    joined: watch::Sender<bool>,
    started: AtomicBool,
    left: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_count: AtomicU64,
}

/// One peer's participation in one room. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RoomMembership {
    inner: Arc<MembershipInner>,
}

impl PartialEq for RoomMembership {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RoomMembership {}

impl std::fmt::Debug for RoomMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomMembership")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl RoomMembership {
    pub(crate) fn new(
        local: PeerId,
        room: Room,
        backend: Arc<dyn RtcBackend>,
        config: MeshConfig,
    ) -> Self {
        let (joined, _) = watch::channel(false);
        Self {
            inner: Arc::new(MembershipInner {
                local,
                room,
                backend,
                config,
                events: Arc::new(RoomEvents::default()),
                sessions: Mutex::new(HashMap::new()),
                presence: Mutex::new(HashMap::new()),
                joined,
                started: AtomicBool::new(false),
                left: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                heartbeat_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn room(&self) -> &Room {
        &self.inner.room
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn events(&self) -> &RoomEvents {
        &self.inner.events
    }

    /// Last presence state observed for `peer` on the room log.
    pub fn presence_of(&self, peer: &PeerId) -> Option<PresenceKind> {
        self.inner.presence.lock().get(peer).copied()
    }

    /// The session for `peer`, if one is currently held.
    pub fn session(&self, peer: &PeerId) -> Option<PeerSession> {
        self.inner.sessions.lock().get(peer).cloned()
    }

    /// Remote peers a session currently exists for.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    /// Remote peers whose data channel is open.
    pub fn ready_peers(&self) -> Vec<PeerId> {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.is_ready())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Number of heartbeat events (`join` + `alive`) pushed so far.
    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeat_count.load(Ordering::Relaxed)
    }

    pub fn has_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    /// Start the heartbeat and pull loops (first call only) and suspend until
    /// the local `join` event is observed back from the log — proof that the
    /// presence write committed.
    pub async fn join(&self) -> Result<(), MeshError> {
        if self.has_left() {
            return Err(MeshError::InvalidArgument(
                "membership has already left the room".to_string(),
            ));
        }
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone()));
            let pull = tokio::spawn(pull_loop(self.inner.clone()));
            self.inner.tasks.lock().extend([heartbeat, pull]);
        }
        let mut joined = self.inner.joined.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(MeshError::Cancelled),
            observed = joined.wait_for(|j| *j) => {
                observed.map(|_| ()).map_err(|_| MeshError::Cancelled)
            }
        }
    }

    /// Push `leave`, stop both loops, close every session, clear indices.
    /// Never fails; the second call is a no-op.
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.started.load(Ordering::SeqCst) {
            let leave = SignalingEvent::Leave {
                peer_id: self.inner.local.clone(),
                room_id: self.inner.room.id().clone(),
            };
            match self.inner.room.adapter().push(leave.clone()).await {
                Ok(()) => self.inner.events.sent_signal.emit(&leave),
                Err(e) => {
                    tracing::warn!(
                        room = %self.inner.room.id(),
                        error = %e,
                        "failed to push leave; departing anyway"
                    );
                }
            }
        }
        self.inner.cancel.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.close().await;
        }
        self.inner.presence.lock().clear();
        tracing::debug!(room = %self.inner.room.id(), peer = %self.inner.local, "left room");
    }

    /// Send `payload` to every remote whose session is `Ready`; sessions
    /// still negotiating are skipped silently. Returns the number of peers
    /// the payload was handed to.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let ready: Vec<PeerSession> = self
            .inner
            .sessions
            .lock()
            .values()
            .filter(|s| s.is_ready())
            .cloned()
            .collect();
        let mut delivered = 0;
        for session in ready {
            match session.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(
                    peer = %session.remote_peer_id(),
                    error = %e,
                    "broadcast skipped session"
                ),
            }
        }
        delivered
    }

    /// Suspend until at least one session is `Ready`.
    pub async fn wait_for_any_ready(&self) -> Result<(), MeshError> {
        loop {
            let notified = self.inner.events.ready.notified();
            if self
                .inner
                .sessions
                .lock()
                .values()
                .any(|s| s.is_ready())
            {
                return Ok(());
            }
            if self.inner.cancel.is_cancelled() {
                return Err(MeshError::Cancelled);
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(MeshError::Cancelled),
                _ = notified => {}
            }
        }
    }
}

/// Push `join` once (retrying through transient failures), then `alive`
/// every heartbeat interval until cancelled.
async fn heartbeat_loop(inner: Arc<MembershipInner>) {
    let join = SignalingEvent::Join {
        peer_id: inner.local.clone(),
        room_id: inner.room.id().clone(),
    };
    if signaling::push_with_retry(
        inner.room.adapter(),
        &inner.cancel,
        inner.config.room_poll,
        &inner.events.sent_signal,
        join,
    )
    .await
    .is_err()
    {
        return; // cancelled before the join committed
    }
    inner.heartbeat_count.fetch_add(1, Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.heartbeat_interval) => {
                let alive = SignalingEvent::Alive {
                    peer_id: inner.local.clone(),
                    room_id: inner.room.id().clone(),
                };
                match inner.room.adapter().push(alive.clone()).await {
                    Ok(()) => {
                        inner.events.sent_signal.emit(&alive);
                        inner.heartbeat_count.fetch_add(1, Ordering::Relaxed);
                    }
                    // The next tick is the retry.
                    Err(e) => tracing::warn!(
                        room = %inner.room.id(),
                        error = %e,
                        "alive heartbeat failed"
                    ),
                }
            }
        }
    }
}

/// Poll the room log: record presence, surface it, and keep the session
/// arena in sync with the remotes it reveals.
async fn pull_loop(inner: Arc<MembershipInner>) {
    let key = LogKey::Room(inner.room.id().clone());
    let mut backoff = PollBackoff::new(inner.config.room_poll);
    let mut cursor: usize = 0;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff.delay()) => {
                match inner.room.adapter().pull(&key, cursor).await {
                    Ok(batch) => {
                        if batch.is_empty() {
                            backoff.on_empty();
                        } else {
                            backoff.on_events();
                        }
                        for slot in batch {
                            cursor += 1;
                            process_room_event(&inner, slot).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            room = %inner.room.id(),
                            error = %e,
                            "room pull failed; backing off"
                        );
                        backoff.on_empty();
                    }
                }
            }
        }
    }
}

async fn process_room_event(inner: &Arc<MembershipInner>, slot: serde_json::Value) {
    let event: SignalingEvent = match serde_json::from_value(slot) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(room = %inner.room.id(), error = %e, "skipping malformed room event");
            return;
        }
    };
    let Some(kind) = event.presence_kind() else {
        tracing::debug!(
            room = %inner.room.id(),
            kind = event.kind(),
            "ignoring channel-keyed event on room log"
        );
        return;
    };
    let peer = event.peer_id().clone();

    inner.presence.lock().insert(peer.clone(), kind);
    inner.events.presence.emit(&PresenceUpdate {
        peer: peer.clone(),
        kind,
    });

    if peer == inner.local {
        // Observing our own join back from the log proves committed presence.
        if kind == PresenceKind::Join {
            inner.joined.send_replace(true);
        }
        return;
    }

    match kind {
        PresenceKind::Join | PresenceKind::Alive => {
            let pair = match ChannelPair::new(
                inner.room.id().clone(),
                inner.local.clone(),
                peer.clone(),
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(room = %inner.room.id(), error = %e, "cannot derive pair channel");
                    return;
                }
            };
            let mut sessions = inner.sessions.lock();
            // A live session means nothing to do; one that closed itself
            // (fatal channel failure) is replaced so the pair can recover.
            let respawn = sessions.get(&peer).map(|s| s.is_closed()).unwrap_or(true);
            if !respawn {
                return;
            }
            if sessions.remove(&peer).is_some() {
                tracing::debug!(
                    room = %inner.room.id(),
                    remote = %peer,
                    "replacing closed session"
                );
            }
            tracing::debug!(
                room = %inner.room.id(),
                remote = %peer,
                channel = %pair.id(),
                initiator = %pair.initiator(),
                "spawning peer session"
            );
            let session = PeerSession::new(
                pair,
                inner.local.clone(),
                inner.room.adapter().clone(),
                inner.backend.clone(),
                inner.config.clone(),
                inner.events.clone(),
                inner.cancel.child_token(),
            );
            session.connect();
            sessions.insert(peer, session);
        }
        PresenceKind::Leave => {
            let session = inner.sessions.lock().remove(&peer);
            if let Some(session) = session {
                tracing::debug!(room = %inner.room.id(), remote = %peer, "remote left; closing session");
                session.close().await;
            }
        }
    }
}
