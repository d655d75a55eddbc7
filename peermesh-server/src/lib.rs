//! HTTP signaling log server.
//!
//! Reference implementation of the signaling surface the SDK's `HttpAdapter`
//! speaks: an in-memory, append-only event log keyed by room or channel id,
//! exposed as `POST /signaling/push` and `GET /signaling/pull`. No
//! authentication, no persistence — a shared bulletin board for peers that
//! can reach the same server.

pub mod config;
pub mod log;
pub mod web;
