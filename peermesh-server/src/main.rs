use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use peermesh_server::config::ServerConfig;
use peermesh_server::log::SignalStore;
use peermesh_server::web;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (PEERMESH_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PEERMESH_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("peermesh_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::parse();
    tracing::info!("Starting signaling server on {}", config.listen_addr);

    let store = SignalStore::new();
    let app = web::router(store, Duration::from_millis(config.max_wait_ms));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
