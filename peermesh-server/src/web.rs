//! The HTTP signaling surface.
//!
//! Two routes:
//! - `POST /signaling/push` — body is one event JSON; answers
//!   `{"index": n, "length": m}` or `{"error": "..."}` with a 400.
//! - `GET /signaling/pull?roomId|channelId=<id>&offsetIndex=<n>[&waitMs=<ms>]`
//!   — answers the JSON array of slots with index >= offset; `waitMs` holds
//!   an empty answer open briefly (bounded long-poll).
//!
//! Validation is deliberately shallow: the server checks exactly what it
//! needs to route and index the event (`peerId`, `type`, exactly one of the
//! two keys) and stores the raw body; event semantics belong to the peers.

use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::log::SignalStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SignalStore,
    pub max_wait: Duration,
}

pub fn router(store: SignalStore, max_wait: Duration) -> Router {
    Router::new()
        .route("/signaling/push", post(push_event))
        .route("/signaling/pull", get(pull_events))
        .layer(CorsLayer::permissive())
        .with_state(AppState { store, max_wait })
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// Resolve the store key from the two optional id fields, enforcing that
/// exactly one is present and non-empty.
fn store_key(room_id: Option<&str>, channel_id: Option<&str>) -> Result<String, &'static str> {
    let room_id = room_id.filter(|id| !id.is_empty());
    let channel_id = channel_id.filter(|id| !id.is_empty());
    match (room_id, channel_id) {
        (Some(room), None) => Ok(format!("room:{room}")),
        (None, Some(channel)) => Ok(format!("channel:{channel}")),
        (Some(_), Some(_)) => Err("event must carry exactly one of roomId and channelId"),
        (None, None) => Err("missing roomId or channelId"),
    }
}

async fn push_event(State(state): State<AppState>, Json(event): Json<Value>) -> Response {
    let Some(body) = event.as_object() else {
        return bad_request("event must be a JSON object");
    };
    let peer_id = body.get("peerId").and_then(Value::as_str).unwrap_or("").to_string();
    if peer_id.is_empty() {
        return bad_request("missing peerId");
    }
    if body.get("type").and_then(Value::as_str).is_none() {
        return bad_request("missing type");
    }
    let key = match store_key(
        body.get("roomId").and_then(Value::as_str),
        body.get("channelId").and_then(Value::as_str),
    ) {
        Ok(key) => key,
        Err(message) => return bad_request(message),
    };

    let (index, length) = state.store.append(&key, event);
    tracing::debug!(key, peer_id, index, "event appended");
    Json(json!({"index": index, "length": length})).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullParams {
    room_id: Option<String>,
    channel_id: Option<String>,
    offset_index: Option<i64>,
    wait_ms: Option<u64>,
}

async fn pull_events(State(state): State<AppState>, Query(params): Query<PullParams>) -> Response {
    let key = match store_key(params.room_id.as_deref(), params.channel_id.as_deref()) {
        Ok(key) => key,
        Err(message) => return bad_request(message),
    };
    let offset = params.offset_index.unwrap_or(0);
    if offset < 0 {
        return bad_request("invalid offsetIndex");
    }
    let offset = offset as usize;

    let events = match params.wait_ms {
        Some(wait_ms) if wait_ms > 0 => {
            let wait = Duration::from_millis(wait_ms).min(state.max_wait);
            state.store.read_wait(&key, offset, wait).await
        }
        _ => state.store.read(&key, offset),
    };
    Json(events).into_response()
}
