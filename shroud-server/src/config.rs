//! Server configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "shroud-server", about = "End-to-end encrypted messaging server")]
pub struct ServerConfig {
    /// HTTP + WebSocket listen address.
    #[arg(long, env = "SHROUD_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Cadence of the self-destruct sweeper, in seconds.
    #[arg(long, env = "SHROUD_SWEEP_INTERVAL", default_value_t = 1)]
    pub sweep_interval_secs: u64,

    /// One-time pre-keys generated per registration.
    #[arg(long, env = "SHROUD_PREKEY_BATCH", default_value_t = 10)]
    pub prekey_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["shroud-server"])
    }
}
