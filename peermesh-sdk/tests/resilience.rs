//! Fault-injection and invariant coverage for the mesh core.
//!
//! Tests cover:
//! - Malformed log records skipped without disturbing neighbors (room and
//!   channel logs)
//! - Transient push/pull failures recovered by loop backoff, events
//!   processed exactly once
//! - Pull cursor monotonicity across both loop kinds
//! - Cancellation quiescence: nothing is pushed after leave resolves
//! - Session re-spawn after a fatal backend failure, surfaced as an error
//!   event first
//! - Broadcast with no ready remotes silently reaching nobody

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use peermesh_sdk::rtc::{
    LoopbackBackend, RtcBackend, RtcConfiguration, RtcEvent, RtcSession,
};
use peermesh_sdk::signaling::{LogKey, MemoryAdapter, SignalingAdapter, SignalingEvent};
use peermesh_sdk::{
    Peer, PeerConfig, PeerId, PresenceKind, Room, RoomId, RtcError, SignalingError,
};

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(60), fut)
        .await
        .expect("test timed out")
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
}

fn peer(id: &str, backend: Arc<dyn RtcBackend>) -> Peer {
    Peer::new(PeerConfig::with_id(id), backend).unwrap()
}

// ── Fault-injecting adapter wrappers ───────────────────────────────────

/// Fails the first N pulls and the first M pushes, then delegates.
struct FlakyAdapter {
    inner: MemoryAdapter,
    pull_failures: AtomicUsize,
    push_failures: AtomicUsize,
}

impl FlakyAdapter {
    fn new(inner: MemoryAdapter, pull_failures: usize, push_failures: usize) -> Self {
        Self {
            inner,
            pull_failures: AtomicUsize::new(pull_failures),
            push_failures: AtomicUsize::new(push_failures),
        }
    }

    fn take_budget(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SignalingAdapter for FlakyAdapter {
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if Self::take_budget(&self.push_failures) {
            return Err(SignalingError::Transport("injected push failure".into()));
        }
        self.inner.push(event).await
    }

    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError> {
        if Self::take_budget(&self.pull_failures) {
            return Err(SignalingError::Transport("injected pull failure".into()));
        }
        self.inner.pull(key, offset_index).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Records every pull offset per key, for cursor assertions.
struct RecordingAdapter {
    inner: MemoryAdapter,
    offsets: Mutex<Vec<(LogKey, usize)>>,
}

impl RecordingAdapter {
    fn new(inner: MemoryAdapter) -> Self {
        Self {
            inner,
            offsets: Mutex::new(Vec::new()),
        }
    }

    fn offsets_for(&self, key: &LogKey) -> Vec<usize> {
        self.offsets
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl SignalingAdapter for RecordingAdapter {
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        self.inner.push(event).await
    }

    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError> {
        self.offsets.lock().push((key.clone(), offset_index));
        self.inner.pull(key, offset_index).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Backend whose first `new_session` calls fail, then delegates to a shared
/// loopback backend.
struct FlakyBackend {
    inner: Arc<LoopbackBackend>,
    failures: AtomicUsize,
}

#[async_trait]
impl RtcBackend for FlakyBackend {
    async fn new_session(
        &self,
        config: &RtcConfiguration,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), RtcError> {
        if FlakyAdapter::take_budget(&self.failures) {
            return Err(RtcError::Backend("injected backend failure".into()));
        }
        self.inner.new_session(config).await
    }
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn malformed_room_records_are_skipped() {
    let adapter = Arc::new(MemoryAdapter::new());
    let backend = Arc::new(LoopbackBackend::new());
    let alice = peer("alice", backend.clone());
    let room = Room::new("r1", adapter.clone());
    let am = within(alice.join(&room)).await.unwrap();

    // Foreign writers corrupt the room log between the two joins.
    let room_key = LogKey::Room(RoomId::from("r1"));
    adapter.push_raw(
        room_key.clone(),
        serde_json::json!({"type": "join", "roomId": "r1"}), // no peerId
    );
    adapter.push_raw(room_key.clone(), serde_json::json!("not even an object"));

    let bob = peer("bob", backend.clone());
    let bm = within(bob.join(&room)).await.unwrap();

    // Events behind the bad slots are still processed normally.
    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();

    // No ghost session was spawned by the malformed records.
    assert_eq!(am.peers(), vec![PeerId::from("bob")]);
}

#[tokio::test(start_paused = true)]
async fn malformed_channel_records_are_skipped() {
    let adapter = Arc::new(MemoryAdapter::new());
    let backend = Arc::new(LoopbackBackend::new());
    let room = Room::new("r1", adapter.clone());

    // Corrupt the pair channel log before either peer starts negotiating.
    let channel_key = LogKey::Channel("r1:alice-bob".into());
    adapter.push_raw(
        channel_key.clone(),
        serde_json::json!({"type": "sdpOffer", "channelId": "r1:alice-bob"}),
    );
    adapter.push_raw(channel_key, serde_json::json!(42));

    let alice = peer("alice", backend.clone());
    let bob = peer("bob", backend.clone());
    let am = within(alice.join(&room)).await.unwrap();
    let bm = within(bob.join(&room)).await.unwrap();

    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_adapter_failures_are_retried() {
    // Three pull failures and three push failures before traffic flows.
    let store = MemoryAdapter::new();
    let adapter = Arc::new(FlakyAdapter::new(store.clone(), 3, 3));
    let backend = Arc::new(LoopbackBackend::new());

    let alice = peer("alice", backend.clone());
    let bob = peer("bob", backend.clone());
    let room = Room::new("r1", adapter.clone());

    let am = within(alice.join(&room)).await.unwrap();
    let bm = within(bob.join(&room)).await.unwrap();
    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();

    // One live session, presence recorded from the recovered pulls.
    assert_eq!(am.peers(), vec![PeerId::from("bob")]);
    assert!(matches!(
        am.presence_of(&PeerId::from("bob")).unwrap(),
        PresenceKind::Join | PresenceKind::Alive
    ));

    // Exactly one delivery per broadcast despite the earlier failures.
    let mut messages = bm.events().message.stream();
    assert_eq!(am.broadcast(b"once").await, 1);
    let first = within(messages.recv()).await.unwrap();
    assert_eq!(first.payload, b"once");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(messages.try_recv().is_none(), "message delivered twice");
}

#[tokio::test(start_paused = true)]
async fn pull_cursors_increase_monotonically() {
    let store = MemoryAdapter::new();
    let adapter = Arc::new(RecordingAdapter::new(store));
    let backend = Arc::new(LoopbackBackend::new());

    let alice = peer("alice", backend.clone());
    let bob = peer("bob", backend.clone());
    let room = Room::new("r1", adapter.clone());
    let am = within(alice.join(&room)).await.unwrap();
    let bm = within(bob.join(&room)).await.unwrap();
    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let room_offsets = adapter.offsets_for(&LogKey::Room(RoomId::from("r1")));
    let channel_offsets = adapter.offsets_for(&LogKey::Channel("r1:alice-bob".into()));
    for offsets in [room_offsets, channel_offsets] {
        assert!(!offsets.is_empty());
        assert!(
            offsets.windows(2).all(|w| w[0] <= w[1]),
            "cursor went backwards: {offsets:?}"
        );
        assert!(
            *offsets.last().unwrap() > 0,
            "cursor never advanced: {offsets:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_is_pushed_after_leave_resolves() {
    let adapter = Arc::new(MemoryAdapter::new());
    let backend = Arc::new(LoopbackBackend::new());
    let alice = peer("alice", backend.clone());
    let bob = peer("bob", backend.clone());
    let room = Room::new("r1", adapter.clone());
    let am = within(alice.join(&room)).await.unwrap();
    let bm = within(bob.join(&room)).await.unwrap();
    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();

    bm.leave().await;

    let bob_events_at_leave: usize = count_events_from(&adapter, "bob");
    // Long past several heartbeat intervals, bob has written nothing more;
    // alice's membership keeps beating.
    let alice_events_at_leave = count_events_from(&adapter, "alice");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count_events_from(&adapter, "bob"), bob_events_at_leave);
    assert!(count_events_from(&adapter, "alice") > alice_events_at_leave);

    // The last room-log event from bob is the leave.
    let room_log = adapter.snapshot(&LogKey::Room(RoomId::from("r1")));
    let last_bob = room_log
        .iter()
        .rev()
        .find(|slot| slot["peerId"] == "bob")
        .unwrap();
    assert_eq!(last_bob["type"], "leave");
}

fn count_events_from(adapter: &MemoryAdapter, peer: &str) -> usize {
    let mut count = adapter
        .snapshot(&LogKey::Room(RoomId::from("r1")))
        .iter()
        .filter(|slot| slot["peerId"] == peer)
        .count();
    count += adapter
        .snapshot(&LogKey::Channel("r1:alice-bob".into()))
        .iter()
        .filter(|slot| slot["peerId"] == peer)
        .count();
    count
}

#[tokio::test(start_paused = true)]
async fn session_respawns_after_fatal_backend_failure() {
    let loopback = Arc::new(LoopbackBackend::new());
    // Alice's first session creation blows up; the retry (provoked by bob's
    // next heartbeat) succeeds.
    let flaky = Arc::new(FlakyBackend {
        inner: loopback.clone(),
        failures: AtomicUsize::new(1),
    });
    let adapter = Arc::new(MemoryAdapter::new());
    let room = Room::new("r1", adapter.clone());

    let alice = peer("alice", flaky);
    let bob = peer("bob", loopback);
    let am = within(alice.join(&room)).await.unwrap();
    // Subscribe before bob is discoverable so the failure cannot be missed.
    let mut faults = am.events().error.stream();
    let bm = within(bob.join(&room)).await.unwrap();

    let fault = within(faults.recv()).await.unwrap();
    assert_eq!(fault.peer, PeerId::from("bob"));
    assert!(fault.detail.contains("injected backend failure"));

    within(am.wait_for_any_ready()).await.unwrap();
    within(bm.wait_for_any_ready()).await.unwrap();
    // Still exactly one session per remote after the replacement.
    assert_eq!(am.peers(), vec![PeerId::from("bob")]);
}

#[tokio::test(start_paused = true)]
async fn broadcast_with_no_ready_remote_reaches_nobody() {
    let adapter = Arc::new(MemoryAdapter::new());
    let backend = Arc::new(LoopbackBackend::new());
    let carol = peer("carol", backend);
    let room = Room::new("lonely", adapter.clone());
    let membership = within(carol.join(&room)).await.unwrap();

    assert_eq!(membership.broadcast(b"anyone?").await, 0);
}
