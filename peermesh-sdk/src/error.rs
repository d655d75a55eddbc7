//! Error taxonomy for the mesh core.
//!
//! Transient signaling failures are retried by the polling loops and never
//! reach the application; negotiation failures tear down the affected session
//! only; `Cancelled` marks operations that raced with shutdown and is treated
//! as a quiet exit, not a fault.

use thiserror::Error;

/// Failures raised by a [`crate::signaling::SignalingAdapter`].
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The underlying transport failed; safe to retry after backoff.
    #[error("signaling transport failure: {0}")]
    Transport(String),

    /// HTTP transport error from the long-poll adapter.
    #[error("signaling http failure: {0}")]
    Http(#[from] reqwest::Error),

    /// The signaling server refused the request.
    #[error("signaling request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The adapter has been closed; no further pushes or pulls are served.
    #[error("signaling adapter closed")]
    Closed,
}

/// Failures raised by the real-time-communication collaborator.
#[derive(Debug, Error)]
pub enum RtcError {
    /// An offer, answer, or candidate was rejected during negotiation.
    #[error("rtc negotiation failed: {0}")]
    Negotiation(String),

    /// The data channel is not open for sending.
    #[error("rtc data channel is not open")]
    ChannelClosed,

    /// The backend failed outside the negotiation path.
    #[error("rtc backend failure: {0}")]
    Backend(String),
}

/// Top-level error type surfaced by the mesh API.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transient push/pull transport error. Loops recover with backoff.
    #[error("transient signaling failure: {0}")]
    Signaling(#[from] SignalingError),

    /// A pulled log slot could not be deserialized. Logged and skipped; the
    /// cursor still advances past the bad slot.
    #[error("malformed signaling event: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    /// The RTC collaborator rejected part of the exchange; the session is
    /// torn down and an `error` event is emitted upward.
    #[error("rtc negotiation failure: {0}")]
    Negotiation(#[from] RtcError),

    /// A message was sent before the pair's data channel opened.
    #[error("peer session is not ready")]
    NotReady,

    /// Invalid caller input, e.g. empty or identical peer ids.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation raced with shutdown. Quiet exit, not an application
    /// fault.
    #[error("operation cancelled")]
    Cancelled,
}

impl MeshError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeshError::Cancelled)
    }
}
