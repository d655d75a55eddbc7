//! Per-pair peer session: drives one channel from "just discovered" to
//! "data channel open", then ferries messages.
//!
//! A session owns one RTC session, a pull cursor over the pair's channel log,
//! and the offer/answer/ICE state machine. Everything runs on one spawned
//! task that multiplexes the adaptive log poll, the backend's event stream,
//! and cancellation; the public handle only reads the state watch and calls
//! into the RTC session for sends.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelPair;
use crate::config::{MeshConfig, PollBackoff};
use crate::error::{MeshError, RtcError};
use crate::id::{ChannelId, PeerId};
use crate::room::{ConnectionUpdate, DataChannelUpdate, IncomingMessage, RoomEvents, SessionFault};
use crate::rtc::{ConnectionState, RtcBackend, RtcEvent, RtcSession};
use crate::signaling::{self, LogKey, SignalingAdapter, SignalingEvent};

/// Lifecycle of one pair negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Initiator: offer pushed, waiting for the answer.
    Offering,
    /// Responder: waiting for the initiator's offer.
    AwaitingOffer,
    /// Responder: offer applied, answer being produced and pushed.
    Answering,
    /// Descriptions exchanged, transport connecting.
    Connecting,
    /// Data channel open; messages flow.
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Offering => "offering",
            Self::AwaitingOffer => "awaiting-offer",
            Self::Answering => "answering",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closed => "closed",
        })
    }
}

struct SessionShared {
    pair: ChannelPair,
    local: PeerId,
    remote: PeerId,
    adapter: Arc<dyn SignalingAdapter>,
    backend: Arc<dyn RtcBackend>,
    config: MeshConfig,
    events: Arc<RoomEvents>,
    state: watch::Sender<SessionState>,
    rtc: Mutex<Option<Arc<dyn RtcSession>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one per-remote session. Cheap to clone.
#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<SessionShared>,
}

impl PeerSession {
    pub(crate) fn new(
        pair: ChannelPair,
        local: PeerId,
        adapter: Arc<dyn SignalingAdapter>,
        backend: Arc<dyn RtcBackend>,
        config: MeshConfig,
        events: Arc<RoomEvents>,
        cancel: CancellationToken,
    ) -> Self {
        let remote = if pair.initiator() == &local {
            pair.responder().clone()
        } else {
            pair.initiator().clone()
        };
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(SessionShared {
                pair,
                local,
                remote,
                adapter,
                backend,
                config,
                events,
                state,
                rtc: Mutex::new(None),
                cancel,
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the session task. Called once by the owning membership right
    /// after the remote is discovered.
    pub(crate) fn connect(&self) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(run(shared));
        *self.shared.task.lock() = Some(handle);
    }

    pub fn remote_peer_id(&self) -> &PeerId {
        &self.shared.remote
    }

    pub fn channel(&self) -> &ChannelPair {
        &self.shared.pair
    }

    pub fn channel_id(&self) -> &ChannelId {
        self.shared.pair.id()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch every state transition, including the final `Closed`.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Send an opaque payload to the remote peer.
    ///
    /// Requires the session to be [`SessionState::Ready`]; fails with
    /// [`MeshError::NotReady`] otherwise, leaving the state untouched.
    pub async fn send(&self, payload: &[u8]) -> Result<(), MeshError> {
        if !self.is_ready() {
            return Err(MeshError::NotReady);
        }
        let rtc = self.shared.rtc.lock().clone();
        match rtc {
            Some(rtc) => rtc.send(payload).await.map_err(MeshError::from),
            None => Err(MeshError::NotReady),
        }
    }

    /// Suspend until the session reaches `Ready`. Resolves with
    /// [`MeshError::Cancelled`] if it closes first.
    pub async fn wait_for_ready(&self) -> Result<(), MeshError> {
        let mut states = self.shared.state.subscribe();
        let settled = states
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| MeshError::Cancelled)?;
        match settled {
            SessionState::Ready => Ok(()),
            _ => Err(MeshError::Cancelled),
        }
    }

    /// Cancel the session and wait for its task to finish cleanup.
    /// Idempotent; reaches `Closed` exactly once from any state.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let task = self.shared.task.lock().take();
        match task {
            Some(task) => {
                let _ = task.await;
            }
            // connect() was never called; nothing is running, close inline.
            None => cleanup(&self.shared).await,
        }
    }
}

enum Flow {
    Continue,
    Shutdown,
}

async fn run(shared: Arc<SessionShared>) {
    if let Some(error) = drive(&shared).await {
        tracing::warn!(
            channel = %shared.pair.id(),
            remote = %shared.remote,
            error = %error,
            "peer session failed"
        );
        shared.events.error.emit(&SessionFault {
            peer: shared.remote.clone(),
            detail: error.to_string(),
        });
    }
    cleanup(&shared).await;
}

/// Main session loop. Returns `Some(error)` for session-fatal conditions
/// that should surface as an `error` event; `None` for quiet exits
/// (cancellation, remote close).
async fn drive(shared: &Arc<SessionShared>) -> Option<MeshError> {
    let rtc_config = shared.adapter.rtc_configuration();
    let (rtc, mut rtc_events) = match shared.backend.new_session(&rtc_config).await {
        Ok(created) => created,
        Err(e) => return Some(MeshError::Negotiation(e)),
    };
    *shared.rtc.lock() = Some(rtc.clone());

    if shared.pair.is_initiator(&shared.local) {
        if let Err(e) = start_offer(shared, &rtc).await {
            return if e.is_cancelled() { None } else { Some(e) };
        }
    } else {
        set_state(shared, SessionState::AwaitingOffer);
    }

    let key = LogKey::Channel(shared.pair.id().clone());
    let mut backoff = PollBackoff::new(shared.config.channel_poll);
    let mut cursor: usize = 0;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff.delay()) => {
                match shared.adapter.pull(&key, cursor).await {
                    Ok(batch) => {
                        if batch.is_empty() {
                            backoff.on_empty();
                        } else {
                            backoff.on_events();
                        }
                        for slot in batch {
                            cursor += 1;
                            if let Err(e) = handle_slot(shared, &rtc, slot).await {
                                return if e.is_cancelled() { None } else { Some(e) };
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            channel = %shared.pair.id(),
                            error = %e,
                            "channel pull failed; backing off"
                        );
                        backoff.on_empty();
                    }
                }
            }
            event = rtc_events.recv() => {
                match event {
                    Some(event) => match handle_rtc(shared, event).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => return None,
                        Err(e) => return if e.is_cancelled() { None } else { Some(e) },
                    },
                    // Backend dropped its event stream; nothing more can arrive.
                    None => return None,
                }
            }
        }
    }
}

/// Initiator entry: request the data channel, produce the offer, publish it.
async fn start_offer(
    shared: &Arc<SessionShared>,
    rtc: &Arc<dyn RtcSession>,
) -> Result<(), MeshError> {
    rtc.open_data_channel(&shared.config.data_channel_label)
        .await
        .map_err(MeshError::from)?;
    let offer = rtc.create_offer().await.map_err(MeshError::from)?;
    set_state(shared, SessionState::Offering);
    push_signal(
        shared,
        SignalingEvent::SdpOffer {
            peer_id: shared.local.clone(),
            channel_id: shared.pair.id().clone(),
            data: offer,
        },
    )
    .await
}

/// Apply one pulled channel-log slot.
async fn handle_slot(
    shared: &Arc<SessionShared>,
    rtc: &Arc<dyn RtcSession>,
    slot: serde_json::Value,
) -> Result<(), MeshError> {
    let event: SignalingEvent = match serde_json::from_value(slot) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                channel = %shared.pair.id(),
                error = %e,
                "skipping malformed channel event"
            );
            return Ok(());
        }
    };
    // Our own events come back on every pull; drop them before state logic.
    if event.peer_id() == &shared.local {
        return Ok(());
    }
    shared.events.received_signal.emit(&event);

    let current = *shared.state.borrow();
    match event {
        SignalingEvent::SdpOffer { data, .. } => match current {
            // A later offer replaces an earlier one: the remote description
            // is re-applied and a fresh answer goes out (last writer wins).
            SessionState::AwaitingOffer | SessionState::Answering | SessionState::Connecting => {
                set_state(shared, SessionState::Answering);
                let answer = rtc
                    .accept_offer_and_create_answer(data)
                    .await
                    .map_err(MeshError::from)?;
                push_signal(
                    shared,
                    SignalingEvent::SdpAnswer {
                        peer_id: shared.local.clone(),
                        channel_id: shared.pair.id().clone(),
                        data: answer,
                    },
                )
                .await?;
                set_state(shared, SessionState::Connecting);
            }
            other => {
                tracing::debug!(channel = %shared.pair.id(), state = %other, "ignoring sdpOffer");
            }
        },
        SignalingEvent::SdpAnswer { data, .. } => match current {
            // Connecting re-applies a later answer the same way a later
            // offer replaces an earlier one; stale answers replayed from the
            // log before the live one are superseded, not fatal.
            SessionState::Offering | SessionState::Connecting => {
                rtc.accept_answer(data).await.map_err(MeshError::from)?;
                set_state(shared, SessionState::Connecting);
            }
            other => {
                tracing::debug!(channel = %shared.pair.id(), state = %other, "ignoring sdpAnswer");
            }
        },
        SignalingEvent::IceCandidate { data, .. } => {
            // Accepted in any state; the backend buffers candidates that
            // arrive before the remote description.
            rtc.add_remote_candidate(data).await.map_err(MeshError::from)?;
        }
        SignalingEvent::SdpRestart { .. } => {
            tracing::debug!(
                channel = %shared.pair.id(),
                "ignoring sdpRestart (no renegotiation path)"
            );
        }
        other => {
            tracing::debug!(
                channel = %shared.pair.id(),
                kind = other.kind(),
                "ignoring room-keyed event on channel log"
            );
        }
    }
    Ok(())
}

/// React to one backend event.
async fn handle_rtc(shared: &Arc<SessionShared>, event: RtcEvent) -> Result<Flow, MeshError> {
    match event {
        RtcEvent::LocalCandidate(Some(candidate)) => {
            push_signal(
                shared,
                SignalingEvent::IceCandidate {
                    peer_id: shared.local.clone(),
                    channel_id: shared.pair.id().clone(),
                    data: candidate,
                },
            )
            .await?;
        }
        // End-of-gathering sentinel; never forwarded onto the log.
        RtcEvent::LocalCandidate(None) => {}
        RtcEvent::DataChannelOpened => {
            let current = *shared.state.borrow();
            if current == SessionState::Connecting {
                set_state(shared, SessionState::Ready);
            } else {
                tracing::debug!(
                    channel = %shared.pair.id(),
                    state = %current,
                    "data channel opened outside connecting"
                );
            }
        }
        RtcEvent::DataChannelState(state) => {
            shared.events.data_channel.emit(&DataChannelUpdate {
                peer: shared.remote.clone(),
                state,
            });
        }
        RtcEvent::ConnectionState(state) => {
            shared.events.peer_connection.emit(&ConnectionUpdate {
                peer: shared.remote.clone(),
                state,
            });
            match state {
                ConnectionState::Failed => {
                    return Err(MeshError::Negotiation(RtcError::Backend(
                        "peer connection failed".into(),
                    )));
                }
                ConnectionState::Closed => {
                    tracing::debug!(
                        channel = %shared.pair.id(),
                        remote = %shared.remote,
                        "peer connection closed"
                    );
                    return Ok(Flow::Shutdown);
                }
                _ => {}
            }
        }
        RtcEvent::Message(payload) => {
            if *shared.state.borrow() == SessionState::Ready {
                shared.events.message.emit(&IncomingMessage {
                    from: shared.remote.clone(),
                    payload,
                });
            } else {
                tracing::debug!(
                    channel = %shared.pair.id(),
                    "dropping payload received outside ready state"
                );
            }
        }
        RtcEvent::Fatal(kind) => {
            return Err(MeshError::Negotiation(RtcError::Backend(kind)));
        }
    }
    Ok(Flow::Continue)
}

async fn push_signal(shared: &Arc<SessionShared>, event: SignalingEvent) -> Result<(), MeshError> {
    signaling::push_with_retry(
        &shared.adapter,
        &shared.cancel,
        shared.config.channel_poll,
        &shared.events.sent_signal,
        event,
    )
    .await
}

fn set_state(shared: &SessionShared, next: SessionState) {
    let mut from = SessionState::Idle;
    let changed = shared.state.send_if_modified(|current| {
        // Closed is terminal; everything else moves forward.
        if *current == next || *current == SessionState::Closed {
            return false;
        }
        from = *current;
        *current = next;
        true
    });
    if changed {
        tracing::debug!(
            channel = %shared.pair.id(),
            remote = %shared.remote,
            %from,
            to = %next,
            "session state"
        );
        if next == SessionState::Ready {
            shared.events.ready.notify_waiters();
        }
    }
}

/// Stop the RTC session and mark the state `Closed`. Idempotent.
async fn cleanup(shared: &Arc<SessionShared>) {
    let newly_closed = shared.state.send_if_modified(|current| {
        if *current == SessionState::Closed {
            false
        } else {
            *current = SessionState::Closed;
            true
        }
    });
    let rtc = shared.rtc.lock().take();
    if let Some(rtc) = rtc {
        rtc.close().await;
    }
    if newly_closed {
        tracing::debug!(
            channel = %shared.pair.id(),
            remote = %shared.remote,
            "session closed"
        );
        shared.events.ready.notify_waiters();
    }
}
