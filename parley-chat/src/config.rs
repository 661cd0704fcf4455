//! Server configuration.

use std::time::Duration;

use crate::fanout::DEFAULT_CHANNEL;
use crate::history::{HISTORY_CAPACITY, REPLAY_LIMIT};
use crate::session::DEFAULT_OUTBOX_CAPACITY;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared store URL
    pub store_url: String,
    /// Messages retained per room
    pub history_capacity: usize,
    /// Messages replayed on join
    pub replay_limit: usize,
    /// Per-session outbox capacity
    pub outbox_capacity: usize,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
    /// Pub/sub channel shared by all instances
    pub fanout_channel: String,
    /// Presence removal attempts on disconnect
    pub presence_cleanup_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            store_url: "redis://localhost:6379".to_string(),
            history_capacity: HISTORY_CAPACITY,
            replay_limit: REPLAY_LIMIT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            store_timeout: Duration::from_secs(5),
            fanout_channel: DEFAULT_CHANNEL.to_string(),
            presence_cleanup_attempts: 3,
        }
    }
}

impl ServerConfig {
    /// Default configuration bound to `bind_addr`.
    pub fn bound_to(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }
}
