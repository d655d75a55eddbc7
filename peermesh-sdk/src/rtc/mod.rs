//! Contract for the real-time-communication collaborator.
//!
//! The mesh core never speaks to a transport stack directly: it drives one
//! [`RtcSession`] per remote peer (one peer connection plus one data channel)
//! and reacts to the [`RtcEvent`]s the backend reports. The value types here
//! mirror the standard session-description / ICE-candidate JSON shapes so any
//! conforming stack can slot in behind the trait; the in-process
//! [`LoopbackBackend`] covers tests and demos.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RtcError;

mod loopback;

pub use loopback::LoopbackBackend;

/// Side of the offer/answer exchange a description belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description blob plus its kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// An opaque ICE candidate descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// One ICE server entry for the peer-connection configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxBundle,
    MaxCompat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcpMuxPolicy {
    Require,
}

/// Configuration handed to the backend when a session is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub bundle_policy: BundlePolicy,
    pub rtcp_mux_policy: RtcpMuxPolicy,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ice_candidate_pool_size: 0,
            bundle_policy: BundlePolicy::Balanced,
            rtcp_mux_policy: RtcpMuxPolicy::Require,
        }
    }
}

/// Peer-connection lifecycle states, reduced to what the core reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Data-channel lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events a backend reports upward, marshaled onto the owning session task
/// through the receiver returned by [`RtcBackend::new_session`].
#[derive(Clone, Debug)]
pub enum RtcEvent {
    /// A locally gathered candidate; `None` marks end of gathering and is
    /// never forwarded onto the signaling log.
    LocalCandidate(Option<IceCandidate>),
    /// The pair data channel is open (locally created or remotely announced).
    DataChannelOpened,
    DataChannelState(DataChannelState),
    ConnectionState(ConnectionState),
    /// An opaque application payload from the remote side.
    Message(Vec<u8>),
    /// The backend failed in a way negotiation cannot recover from.
    Fatal(String),
}

/// One peer connection plus one data channel.
///
/// All operations are suspending; callbacks never run on the caller — state
/// reaches the core only through the event receiver.
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Produce a local offer (implicitly setting the local description).
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Apply the remote offer, then produce and set the local answer.
    async fn accept_offer_and_create_answer(
        &self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, RtcError>;

    /// Apply the remote answer to a previously created offer.
    async fn accept_answer(&self, remote: SessionDescription) -> Result<(), RtcError>;

    /// Feed a remote candidate. Must be accepted in any negotiation state;
    /// candidates arriving before the remote description are buffered.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Request the data channel. The initiator calls this before creating
    /// its offer; the responder learns of the channel through
    /// [`RtcEvent::DataChannelOpened`].
    async fn open_data_channel(&self, label: &str) -> Result<(), RtcError>;

    /// Send an opaque payload over the open data channel.
    async fn send(&self, payload: &[u8]) -> Result<(), RtcError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Factory for [`RtcSession`]s.
#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn new_session(
        &self,
        config: &RtcConfiguration,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), RtcError>;
}
