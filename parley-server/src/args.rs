//! Command-line arguments for the chat server.
//!
//! Every flag can also be set from the environment.

use std::time::Duration;

use clap::Parser;
use parley_chat::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Shared store URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Pub/sub channel shared by every instance
    #[arg(long, env = "PARLEY_CHANNEL", default_value = "parley:events")]
    pub channel: String,

    /// Messages replayed to a session when it joins
    #[arg(long, env = "PARLEY_REPLAY_LIMIT", default_value_t = 50)]
    pub replay_limit: usize,

    /// Per-session outbox capacity
    #[arg(long, env = "PARLEY_OUTBOX_CAPACITY", default_value_t = 256)]
    pub outbox_capacity: usize,

    /// Store operation timeout in milliseconds
    #[arg(long, env = "PARLEY_STORE_TIMEOUT_MS", default_value_t = 5000)]
    pub store_timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr(),
            store_url: self.redis_url,
            replay_limit: self.replay_limit,
            outbox_capacity: self.outbox_capacity,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            fanout_channel: self.channel,
            ..ServerConfig::default()
        }
    }
}
