//! Signaling event model and the append-only log adapter contract.
//!
//! Every event is keyed by exactly one of `roomId` (presence traffic) or
//! `channelId` (per-pair negotiation traffic) and carries the `peerId` of its
//! author. Adapters store events per key in append order; consumers pull with
//! an offset cursor and deserialize slot by slot, so one malformed record
//! never poisons the log for the events behind it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::{PollBackoff, PollConfig};
use crate::error::{MeshError, SignalingError};
use crate::id::{ChannelId, PeerId, RoomId};
use crate::rtc::{IceCandidate, RtcConfiguration, SessionDescription};

mod broadcast;
mod http;
mod memory;

pub use broadcast::{BroadcastAdapter, BroadcastHub};
pub use http::HttpAdapter;
pub use memory::MemoryAdapter;

/// One record on a signaling log, in the JSON wire shape:
///
/// ```json
/// { "peerId": "alice", "roomId": "r1", "type": "join" }
/// { "peerId": "alice", "channelId": "r1:alice-bob", "type": "sdpOffer", "data": { ... } }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalingEvent {
    Join {
        peer_id: PeerId,
        room_id: RoomId,
    },
    Alive {
        peer_id: PeerId,
        room_id: RoomId,
    },
    Leave {
        peer_id: PeerId,
        room_id: RoomId,
    },
    SdpOffer {
        peer_id: PeerId,
        channel_id: ChannelId,
        data: SessionDescription,
    },
    SdpAnswer {
        peer_id: PeerId,
        channel_id: ChannelId,
        data: SessionDescription,
    },
    IceCandidate {
        peer_id: PeerId,
        channel_id: ChannelId,
        data: IceCandidate,
    },
    /// Reserved for renegotiation; accepted and ignored by current sessions.
    SdpRestart {
        peer_id: PeerId,
        channel_id: ChannelId,
    },
}

impl SignalingEvent {
    /// The author of the event.
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Join { peer_id, .. }
            | Self::Alive { peer_id, .. }
            | Self::Leave { peer_id, .. }
            | Self::SdpOffer { peer_id, .. }
            | Self::SdpAnswer { peer_id, .. }
            | Self::IceCandidate { peer_id, .. }
            | Self::SdpRestart { peer_id, .. } => peer_id,
        }
    }

    /// The log this event belongs to.
    pub fn key(&self) -> LogKey {
        match self {
            Self::Join { room_id, .. }
            | Self::Alive { room_id, .. }
            | Self::Leave { room_id, .. } => LogKey::Room(room_id.clone()),
            Self::SdpOffer { channel_id, .. }
            | Self::SdpAnswer { channel_id, .. }
            | Self::IceCandidate { channel_id, .. }
            | Self::SdpRestart { channel_id, .. } => LogKey::Channel(channel_id.clone()),
        }
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Alive { .. } => "alive",
            Self::Leave { .. } => "leave",
            Self::SdpOffer { .. } => "sdpOffer",
            Self::SdpAnswer { .. } => "sdpAnswer",
            Self::IceCandidate { .. } => "iceCandidate",
            Self::SdpRestart { .. } => "sdpRestart",
        }
    }

    /// `Some` for the room-keyed presence variants.
    pub fn presence_kind(&self) -> Option<PresenceKind> {
        match self {
            Self::Join { .. } => Some(PresenceKind::Join),
            Self::Alive { .. } => Some(PresenceKind::Alive),
            Self::Leave { .. } => Some(PresenceKind::Leave),
            _ => None,
        }
    }
}

/// The three presence states a room log reports per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceKind {
    Join,
    Alive,
    Leave,
}

impl std::fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Alive => "alive",
            Self::Leave => "leave",
        })
    }
}

/// Selects one append-only log inside an adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LogKey {
    Room(RoomId),
    Channel(ChannelId),
}

impl std::fmt::Display for LogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room:{id}"),
            Self::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

/// Append-only event log with per-key FIFO ordering and eventual visibility.
///
/// `pull` hands back raw JSON slots rather than typed events: the consumer
/// owns the malformed-record policy (log, skip, advance the cursor), and a
/// foreign writer on a shared log cannot wedge a conforming reader.
#[async_trait]
pub trait SignalingAdapter: Send + Sync {
    /// Append `event` to the log selected by its key. At-least-once append is
    /// sufficient; downstream handlers tolerate duplicates.
    async fn push(&self, event: SignalingEvent) -> Result<(), SignalingError>;

    /// Return the slots with index >= `offset_index`, in append order.
    /// An empty batch is a valid answer.
    async fn pull(
        &self,
        key: &LogKey,
        offset_index: usize,
    ) -> Result<Vec<serde_json::Value>, SignalingError>;

    /// Release adapter-side resources. Idempotent.
    async fn close(&self);

    /// Default configuration for the RTC collaborator.
    fn rtc_configuration(&self) -> RtcConfiguration {
        RtcConfiguration::default()
    }
}

/// Push with retry-on-transient-failure, honoring cancellation between
/// attempts. Emits on the `sent` bus once the append has been accepted.
pub(crate) async fn push_with_retry(
    adapter: &Arc<dyn SignalingAdapter>,
    cancel: &CancellationToken,
    poll: PollConfig,
    sent: &EventBus<SignalingEvent>,
    event: SignalingEvent,
) -> Result<(), MeshError> {
    let mut backoff = PollBackoff::new(poll);
    loop {
        if cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        match adapter.push(event.clone()).await {
            Ok(()) => {
                sent.emit(&event);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(kind = event.kind(), error = %e, "signaling push failed; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                    _ = tokio::time::sleep(backoff.delay()) => backoff.on_empty(),
                }
            }
        }
    }
}
