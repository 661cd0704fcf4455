//! Shared store client: the only state shared between server instances.
//!
//! Architecture:
//! ```text
//! ┌────────────┐  ┌──────────────┐  ┌─────────────┐
//! │ HistoryLog │  │ PresenceReg. │  │ FanoutBridge│
//! │ list ops   │  │ set ops      │  │ pub/sub     │
//! └─────┬──────┘  └──────┬───────┘  └──────┬──────┘
//!       └────────────────┼─────────────────┘
//!                        ▼
//!                 dyn SharedStore
//!                 ├── RedisStore  (production)
//!                 └── MemoryStore (single process, tests)
//! ```
//!
//! List indices follow Redis semantics: `start`/`end` are inclusive and
//! negative values count from the tail (`-1` is the last element).

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Payloads received on a subscribed channel, in publish order.
pub type Subscription = mpsc::Receiver<Vec<u8>>;

/// Buffered payloads per subscription before the forwarder waits.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Transient backend failure or timeout; the triggering operation is dropped
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Could not establish the initial connection
    #[error("Store connection failed: {0}")]
    Connection(String),
}

/// Key/list/set/pub-sub contract used by every component above it.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Push `value` to the head of the list at `key`.
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Keep only the elements in `[start, end]`.
    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<(), StoreError>;

    /// Elements in `[start, end]`, head first. Missing keys are empty.
    async fn list_range(&self, key: &str, start: isize, end: isize)
        -> Result<Vec<String>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Removing a non-member is a no-op.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Resolve Redis-style inclusive indices against a list of `len` elements.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len || end < 0 {
        return None;
    }
    Some((start as usize, end as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_basic() {
        assert_eq!(resolve_range(10, 0, 4), Some((0, 4)));
        assert_eq!(resolve_range(10, 0, 99), Some((0, 9)));
        assert_eq!(resolve_range(3, 0, 999), Some((0, 2)));
    }

    #[test]
    fn test_resolve_range_negative() {
        assert_eq!(resolve_range(10, 0, -1), Some((0, 9)));
        assert_eq!(resolve_range(10, -3, -1), Some((7, 9)));
        assert_eq!(resolve_range(10, -100, 2), Some((0, 2)));
    }

    #[test]
    fn test_resolve_range_empty() {
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(5, 3, 1), None);
        assert_eq!(resolve_range(5, 5, 10), None);
        assert_eq!(resolve_range(5, 0, -10), None);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("timed out".into());
        assert_eq!(err.to_string(), "Store unavailable: timed out");
    }
}
