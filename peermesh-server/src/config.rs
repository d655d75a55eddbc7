//! Server configuration from CLI flags and environment.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "peermesh-server", about = "In-memory HTTP signaling log for peermesh")]
pub struct ServerConfig {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "PEERMESH_LISTEN_ADDR", default_value = "127.0.0.1:8383")]
    pub listen_addr: String,

    /// Upper bound for the `waitMs` long-poll hint, in milliseconds.
    #[arg(long, env = "PEERMESH_MAX_WAIT_MS", default_value_t = 30_000)]
    pub max_wait_ms: u64,
}
