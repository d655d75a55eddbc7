//! In-process loopback RTC backend.
//!
//! Sessions pair through the session-description blobs themselves: each
//! session mints a token, publishes it as its "SDP", and the counterpart
//! resolves the token in a registry shared by all sessions of one backend.
//! Frames then flow over unbounded channels. One synthetic host candidate
//! plus the end-of-gathering sentinel is reported per side so the candidate
//! path of the negotiation is exercised end to end.
//!
//! Both peers must hold the same `LoopbackBackend` (it is process-local, the
//! way peers of a shared in-memory signaling adapter are), which makes it the
//! substrate for the integration suites and demos; real deployments plug a
//! transport stack in behind the same traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::RtcError;

use super::{
    ConnectionState, DataChannelState, IceCandidate, RtcBackend, RtcConfiguration, RtcEvent,
    RtcSession, SdpKind, SessionDescription,
};

enum Frame {
    Open,
    Msg(Vec<u8>),
    Close,
}

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

/// Backend whose sessions connect to each other inside one process.
pub struct LoopbackBackend {
    registry: Registry,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn make_session(&self) -> (Arc<LoopbackSession>, mpsc::UnboundedReceiver<RtcEvent>) {
        let token = format!("lb-{:016x}", rand::thread_rng().r#gen::<u64>());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        self.registry.lock().insert(token.clone(), frame_tx);

        let session = Arc::new(LoopbackSession {
            token,
            registry: self.registry.clone(),
            events: event_tx.clone(),
            peer: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            channel_requested: AtomicBool::new(false),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let pump = session.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                match frame {
                    Frame::Open => {
                        pump.open.store(true, Ordering::SeqCst);
                        let _ = event_tx.send(RtcEvent::ConnectionState(ConnectionState::Connected));
                        let _ = event_tx.send(RtcEvent::DataChannelState(DataChannelState::Open));
                        let _ = event_tx.send(RtcEvent::DataChannelOpened);
                    }
                    Frame::Msg(payload) => {
                        let _ = event_tx.send(RtcEvent::Message(payload));
                    }
                    Frame::Close => {
                        pump.open.store(false, Ordering::SeqCst);
                        let _ = event_tx.send(RtcEvent::DataChannelState(DataChannelState::Closed));
                        let _ = event_tx.send(RtcEvent::ConnectionState(ConnectionState::Closed));
                        break;
                    }
                }
            }
        });

        (session, event_rx)
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn new_session(
        &self,
        _config: &RtcConfiguration,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), RtcError> {
        let (session, event_rx) = self.make_session();
        Ok((session, event_rx))
    }
}

struct LoopbackSession {
    token: String,
    registry: Registry,
    events: mpsc::UnboundedSender<RtcEvent>,
    peer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Buffered regardless of negotiation state; nothing is dropped.
    remote_candidates: Mutex<Vec<IceCandidate>>,
    channel_requested: AtomicBool,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackSession {
    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("loopback/{}", self.token),
        }
    }

    /// Resolve the counterpart a description points at. A well-formed
    /// description whose session is gone (stale log replay after a rejoin)
    /// is accepted but yields no pairing, the way a real stack applies a
    /// remote description without knowing whether the peer is reachable.
    fn resolve(
        &self,
        remote: &SessionDescription,
    ) -> Result<Option<mpsc::UnboundedSender<Frame>>, RtcError> {
        let token = remote
            .sdp
            .strip_prefix("loopback/")
            .ok_or_else(|| RtcError::Negotiation("unrecognized session description".into()))?;
        let peer = self.registry.lock().get(token).cloned();
        if peer.is_none() {
            tracing::debug!(token, "remote description points at a departed session");
        }
        Ok(peer)
    }

    fn gather_candidates(&self) {
        let candidate = IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 0 typ host", self.token),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let _ = self.events.send(RtcEvent::LocalCandidate(Some(candidate)));
        let _ = self.events.send(RtcEvent::LocalCandidate(None));
    }

    fn ensure_live(&self) -> Result<(), RtcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Backend("session closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcSession for LoopbackSession {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_live()?;
        self.gather_candidates();
        Ok(self.description(SdpKind::Offer))
    }

    async fn accept_offer_and_create_answer(
        &self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, RtcError> {
        self.ensure_live()?;
        if remote.kind != SdpKind::Offer {
            return Err(RtcError::Negotiation("expected an offer".into()));
        }
        // A later offer replaces the earlier pairing (last writer wins).
        if let Some(peer) = self.resolve(&remote)? {
            *self.peer.lock() = Some(peer);
        }
        self.gather_candidates();
        Ok(self.description(SdpKind::Answer))
    }

    async fn accept_answer(&self, remote: SessionDescription) -> Result<(), RtcError> {
        self.ensure_live()?;
        if remote.kind != SdpKind::Answer {
            return Err(RtcError::Negotiation("expected an answer".into()));
        }
        let Some(peer) = self.resolve(&remote)? else {
            return Ok(());
        };
        *self.peer.lock() = Some(peer.clone());
        let _ = self
            .events
            .send(RtcEvent::ConnectionState(ConnectionState::Connected));
        if self.channel_requested.load(Ordering::SeqCst) {
            self.open.store(true, Ordering::SeqCst);
            let _ = peer.send(Frame::Open);
            let _ = self
                .events
                .send(RtcEvent::DataChannelState(DataChannelState::Open));
            let _ = self.events.send(RtcEvent::DataChannelOpened);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.ensure_live()?;
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), RtcError> {
        self.ensure_live()?;
        tracing::trace!(label, token = %self.token, "data channel requested");
        self.channel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), RtcError> {
        if self.closed.load(Ordering::SeqCst) || !self.open.load(Ordering::SeqCst) {
            return Err(RtcError::ChannelClosed);
        }
        let peer = self.peer.lock().clone();
        match peer {
            Some(peer) => peer
                .send(Frame::Msg(payload.to_vec()))
                .map_err(|_| RtcError::ChannelClosed),
            None => Err(RtcError::ChannelClosed),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.registry.lock().remove(&self.token);
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(Frame::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<RtcEvent>,
        mut pred: impl FnMut(&RtcEvent) -> bool,
    ) -> RtcEvent {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn pair_negotiates_and_exchanges_messages() {
        let backend = LoopbackBackend::new();
        let (initiator, mut init_rx) = backend.make_session();
        let (responder, mut resp_rx) = backend.make_session();

        initiator.open_data_channel("default").await.unwrap();
        let offer = initiator.create_offer().await.unwrap();
        let answer = responder
            .accept_offer_and_create_answer(offer)
            .await
            .unwrap();
        initiator.accept_answer(answer).await.unwrap();

        wait_for(&mut init_rx, |e| matches!(e, RtcEvent::DataChannelOpened)).await;
        wait_for(&mut resp_rx, |e| matches!(e, RtcEvent::DataChannelOpened)).await;

        initiator.send(b"ping").await.unwrap();
        let msg = wait_for(&mut resp_rx, |e| matches!(e, RtcEvent::Message(_))).await;
        match msg {
            RtcEvent::Message(payload) => assert_eq!(payload, b"ping"),
            _ => unreachable!(),
        }

        responder.send(b"pong").await.unwrap();
        let msg = wait_for(&mut init_rx, |e| matches!(e, RtcEvent::Message(_))).await;
        match msg {
            RtcEvent::Message(payload) => assert_eq!(payload, b"pong"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn gathering_reports_candidate_then_sentinel() {
        let backend = LoopbackBackend::new();
        let (session, mut rx) = backend.make_session();
        session.create_offer().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RtcEvent::LocalCandidate(Some(_))));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, RtcEvent::LocalCandidate(None)));
    }

    #[tokio::test]
    async fn candidates_before_remote_description_are_buffered() {
        let backend = LoopbackBackend::new();
        let (session, _rx) = backend.make_session();
        for i in 0..3 {
            session
                .add_remote_candidate(IceCandidate {
                    candidate: format!("candidate:{i}"),
                    sdp_mid: None,
                    sdp_mline_index: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(session.remote_candidates.lock().len(), 3);
    }

    #[tokio::test]
    async fn foreign_description_is_rejected() {
        let backend = LoopbackBackend::new();
        let (session, _rx) = backend.make_session();
        let foreign = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1".to_string(),
        };
        assert!(matches!(
            session.accept_offer_and_create_answer(foreign).await,
            Err(RtcError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn departed_session_description_is_accepted_but_unpaired() {
        let backend = LoopbackBackend::new();
        let (session, _rx) = backend.make_session();
        let stale = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "loopback/lb-0000000000000000".to_string(),
        };
        let answer = session
            .accept_offer_and_create_answer(stale)
            .await
            .unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        // No pairing happened, so the channel never opens for sending.
        assert!(matches!(
            session.send(b"nobody home").await,
            Err(RtcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn send_before_open_is_rejected_and_close_is_idempotent() {
        let backend = LoopbackBackend::new();
        let (session, _rx) = backend.make_session();
        assert!(matches!(
            session.send(b"early").await,
            Err(RtcError::ChannelClosed)
        ));
        session.close().await;
        session.close().await;
        assert!(matches!(
            session.create_offer().await,
            Err(RtcError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn remote_close_surfaces_connection_closed() {
        let backend = LoopbackBackend::new();
        let (initiator, mut init_rx) = backend.make_session();
        let (responder, mut resp_rx) = backend.make_session();

        initiator.open_data_channel("default").await.unwrap();
        let offer = initiator.create_offer().await.unwrap();
        let answer = responder
            .accept_offer_and_create_answer(offer)
            .await
            .unwrap();
        initiator.accept_answer(answer).await.unwrap();
        wait_for(&mut init_rx, |e| matches!(e, RtcEvent::DataChannelOpened)).await;
        wait_for(&mut resp_rx, |e| matches!(e, RtcEvent::DataChannelOpened)).await;

        initiator.close().await;
        wait_for(&mut resp_rx, |e| {
            matches!(e, RtcEvent::ConnectionState(ConnectionState::Closed))
        })
        .await;
    }
}
