//! Pair-channel identity and initiator election.
//!
//! The channel id for two peers in a room is `"{roomId}:{lo}-{hi}"` with the
//! peer ids ordered by codepoint, so both sides derive the identical id no
//! matter who discovered whom first. The peer holding the smaller id is the
//! initiator: it opens the data channel and sends the offer; the other side
//! answers.

use crate::error::MeshError;
use crate::id::{ChannelId, PeerId, RoomId};

/// The derived identity of one pair channel. Pure value; recomputed wherever
/// needed, never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelPair {
    room_id: RoomId,
    lo: PeerId,
    hi: PeerId,
    channel_id: ChannelId,
}

impl ChannelPair {
    /// Derive the channel identity for `a` and `b` in `room_id`.
    ///
    /// Empty or identical peer ids are rejected with
    /// [`MeshError::InvalidArgument`].
    pub fn new(room_id: RoomId, a: PeerId, b: PeerId) -> Result<Self, MeshError> {
        if a.is_empty() || b.is_empty() {
            return Err(MeshError::InvalidArgument(
                "peer ids must be non-empty".to_string(),
            ));
        }
        if a == b {
            return Err(MeshError::InvalidArgument(format!(
                "cannot derive a pair channel for identical peer ids ({a})"
            )));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let channel_id = ChannelId::new(format!("{room_id}:{lo}-{hi}"));
        Ok(Self {
            room_id,
            lo,
            hi,
            channel_id,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The side that opens the data channel and sends the offer.
    pub fn initiator(&self) -> &PeerId {
        &self.lo
    }

    /// The side that answers.
    pub fn responder(&self) -> &PeerId {
        &self.hi
    }

    pub fn is_initiator(&self, peer: &PeerId) -> bool {
        &self.lo == peer
    }
}
