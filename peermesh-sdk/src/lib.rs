//! Peer-to-peer mesh coordination over a pluggable signaling event log.
//!
//! Peers join named rooms; for every other peer observed in the same room a
//! direct, media-agnostic data channel is negotiated through a standard
//! offer/answer/ICE exchange. The room is the presence fabric (join/alive/leave
//! heartbeats over a shared append-only log); the per-pair channel log carries
//! the negotiation; once the data channel is open, application payloads flow
//! peer to peer.
//!
//! The moving parts, bottom up:
//!
//! - [`signaling`] — the append-only event log contract plus in-memory,
//!   broadcast-channel, and HTTP adapters.
//! - [`channel`] — deterministic pair-channel identity and initiator election.
//! - [`rtc`] — the narrow contract for the real-time transport collaborator,
//!   with an in-process loopback backend for tests and demos.
//! - [`session`] — one [`session::PeerSession`] per remote peer: the
//!   offer/answer/ICE state machine and the channel-log pull loop.
//! - [`room`] — [`room::RoomMembership`]: the presence heartbeat, the room-log
//!   pull loop, and the set of live peer sessions.
//! - [`peer`] — the top-level [`peer::Peer`] handle owning an identity and its
//!   room memberships.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peermesh_sdk::{Peer, PeerConfig, Room};
//! use peermesh_sdk::rtc::LoopbackBackend;
//! use peermesh_sdk::signaling::MemoryAdapter;
//!
//! # async fn example() -> Result<(), peermesh_sdk::MeshError> {
//! let adapter = Arc::new(MemoryAdapter::new());
//! let backend = Arc::new(LoopbackBackend::new());
//!
//! let alice = Peer::new(PeerConfig::with_id("alice"), backend.clone())?;
//! let room = Room::new("lobby", adapter);
//!
//! let membership = alice.join(&room).await?;
//! membership.wait_for_any_ready().await?;
//! membership.broadcast(b"hello mesh").await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod id;
pub mod peer;
pub mod room;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use bus::{EventBus, EventStream, Subscription};
pub use channel::ChannelPair;
pub use config::{MeshConfig, PollConfig};
pub use error::{MeshError, RtcError, SignalingError};
pub use id::{ChannelId, PeerId, RoomId};
pub use peer::{Peer, PeerConfig};
pub use room::{Room, RoomMembership};
pub use session::{PeerSession, SessionState};
pub use signaling::{PresenceKind, SignalingAdapter, SignalingEvent};
