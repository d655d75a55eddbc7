//! HTTP surface tests against a real bound listener.
//!
//! Tests cover:
//! - Push happy path: `{index, length}` receipts, per-key FIFO
//! - Validation: missing peerId, missing/both keys, invalid offset
//! - Pull with offset, unknown logs, and the `waitMs` long-poll hint
//! - A full SDK mesh (two peers, HttpAdapter + loopback RTC) over the server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};

use peermesh_server::log::SignalStore;
use peermesh_server::web;

async fn spawn_server() -> Result<(SocketAddr, SignalStore)> {
    let store = SignalStore::new();
    let app = web::router(store.clone(), Duration::from_secs(5));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server crashed");
    });
    Ok((addr, store))
}

fn join_event(peer: &str, room: &str) -> Value {
    json!({"peerId": peer, "roomId": room, "type": "join"})
}

#[tokio::test]
async fn push_returns_index_and_length() -> Result<()> {
    let (addr, _store) = spawn_server().await?;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/signaling/push");

    let first: Value = client
        .post(&url)
        .json(&join_event("alice", "r1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(first, json!({"index": 0, "length": 1}));

    let second: Value = client
        .post(&url)
        .json(&join_event("bob", "r1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(second, json!({"index": 1, "length": 2}));
    Ok(())
}

#[tokio::test]
async fn push_validation_rejects_bad_events() -> Result<()> {
    let (addr, _store) = spawn_server().await?;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/signaling/push");

    let cases = [
        json!({"roomId": "r1", "type": "join"}),                            // no peerId
        json!({"peerId": "", "roomId": "r1", "type": "join"}),              // empty peerId
        json!({"peerId": "a", "type": "join"}),                             // no key
        json!({"peerId": "a", "roomId": "r", "channelId": "c", "type": "join"}), // both keys
        json!({"peerId": "a", "roomId": "r"}),                              // no type
        json!("not an object"),
    ];
    for event in cases {
        let response = client.post(&url).json(&event).send().await?;
        assert_eq!(response.status(), 400, "accepted: {event}");
        let body: Value = response.json().await?;
        assert!(body["error"].is_string());
    }
    Ok(())
}

#[tokio::test]
async fn pull_respects_offset_and_key() -> Result<()> {
    let (addr, _store) = spawn_server().await?;
    let client = reqwest::Client::new();
    let push_url = format!("http://{addr}/signaling/push");
    for peer in ["a", "b", "c"] {
        client
            .post(&push_url)
            .json(&join_event(peer, "r1"))
            .send()
            .await?;
    }

    let pull_url = format!("http://{addr}/signaling/pull");
    let all: Vec<Value> = client
        .get(&pull_url)
        .query(&[("roomId", "r1"), ("offsetIndex", "0")])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(all.len(), 3);
    assert_eq!(all[0]["peerId"], "a");
    assert_eq!(all[2]["peerId"], "c");

    let tail: Vec<Value> = client
        .get(&pull_url)
        .query(&[("roomId", "r1"), ("offsetIndex", "1")])
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0]["peerId"], "b");

    // An unknown log is an empty array, not an error.
    let empty: Vec<Value> = client
        .get(&pull_url)
        .query(&[("roomId", "nowhere"), ("offsetIndex", "0")])
        .send()
        .await?
        .json()
        .await?;
    assert!(empty.is_empty());
    Ok(())
}

#[tokio::test]
async fn pull_validation_rejects_bad_queries() -> Result<()> {
    let (addr, _store) = spawn_server().await?;
    let client = reqwest::Client::new();
    let pull_url = format!("http://{addr}/signaling/pull");

    let cases: &[&[(&str, &str)]] = &[
        &[("offsetIndex", "0")],                                    // no key
        &[("roomId", "r"), ("channelId", "c"), ("offsetIndex", "0")], // both keys
        &[("roomId", "r"), ("offsetIndex", "-3")],                  // negative offset
    ];
    for query in cases {
        let response = client.get(&pull_url).query(query).send().await?;
        assert_eq!(response.status(), 400, "accepted: {query:?}");
    }
    Ok(())
}

#[tokio::test]
async fn long_poll_returns_as_soon_as_an_event_lands() -> Result<()> {
    let (addr, store) = spawn_server().await?;
    let client = reqwest::Client::new();

    let appender = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.append("room:r1", join_event("late", "r1"));
    });

    let started = std::time::Instant::now();
    let events: Vec<Value> = client
        .get(format!("http://{addr}/signaling/pull"))
        .query(&[("roomId", "r1"), ("offsetIndex", "0"), ("waitMs", "3000")])
        .send()
        .await?
        .json()
        .await?;
    appender.await?;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["peerId"], "late");
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "long poll waited out the full budget"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sdk_mesh_over_the_http_surface() -> Result<()> {
    use peermesh_sdk::rtc::LoopbackBackend;
    use peermesh_sdk::signaling::HttpAdapter;
    use peermesh_sdk::{Peer, PeerConfig, Room};

    let (addr, _store) = spawn_server().await?;
    let base = format!("http://{addr}");

    // Both peers run in this process (the loopback backend is shared); the
    // signaling log is the real HTTP server.
    let backend = Arc::new(LoopbackBackend::new());
    let adapter = Arc::new(HttpAdapter::new(&base));
    let alice = Peer::new(PeerConfig::with_id("alice"), backend.clone())?;
    let bob = Peer::new(PeerConfig::with_id("bob"), backend.clone())?;
    let room = Room::new("r1", adapter);

    let am = tokio::time::timeout(Duration::from_secs(10), alice.join(&room)).await??;
    let bm = tokio::time::timeout(Duration::from_secs(10), bob.join(&room)).await??;

    tokio::time::timeout(Duration::from_secs(10), am.wait_for_any_ready()).await??;
    tokio::time::timeout(Duration::from_secs(10), bm.wait_for_any_ready()).await??;

    let mut messages = bm.events().message.stream();
    assert_eq!(am.broadcast(b"over http").await, 1);
    let received = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await?
        .expect("message stream ended");
    assert_eq!(received.payload, b"over http");

    bm.leave().await;
    am.leave().await;
    Ok(())
}
