//! Three peers meshing up inside one process.
//!
//! Uses the broadcast-channel signaling substrate and the loopback RTC
//! backend, so the whole offer/answer/ICE dance runs for real with no
//! network. Run with `RUST_LOG=peermesh_sdk=debug` to watch the negotiation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use peermesh_sdk::rtc::LoopbackBackend;
use peermesh_sdk::signaling::BroadcastHub;
use peermesh_sdk::{Peer, PeerConfig, Room};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hub = BroadcastHub::new();
    let backend = Arc::new(LoopbackBackend::new());

    let mut memberships = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let peer = Peer::new(PeerConfig::with_id(name), backend.clone())?;
        let room = Room::new("lobby", Arc::new(hub.adapter()));
        let membership = peer.join(&room).await?;

        let me = name.to_string();
        membership
            .events()
            .message
            .on(move |msg| {
                println!(
                    "[{me}] {} says: {}",
                    msg.from,
                    String::from_utf8_lossy(&msg.payload)
                );
            })
            .detach();
        let me = name.to_string();
        membership
            .events()
            .presence
            .on(move |update| println!("[{me}] presence: {} is {}", update.peer, update.kind))
            .detach();

        memberships.push((peer, membership));
    }

    // Wait until every peer can reach both others.
    for (_, membership) in &memberships {
        while membership.ready_peers().len() < 2 {
            membership.wait_for_any_ready().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    println!("mesh is up: every pair has a direct channel");

    let (_, alice) = &memberships[0];
    let reached = alice.broadcast(b"hello from alice").await;
    println!("alice reached {reached} peers");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for (peer, _) in &memberships {
        peer.close().await;
    }
    Ok(())
}
