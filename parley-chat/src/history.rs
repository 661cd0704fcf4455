//! Bounded per-room message history.
//!
//! Each room's log is a list at `chat:{room}`, newest first. `append` pushes
//! then trims; the pair is not atomic, so a crash in between can leave a few
//! extra entries until the next append trims them again.

use std::sync::Arc;

use crate::protocol::{ChatMessage, ProtocolError};
use crate::store::{SharedStore, StoreError};

/// Entries retained per room.
pub const HISTORY_CAPACITY: usize = 1000;
/// Entries replayed to a session when it joins.
pub const REPLAY_LIMIT: usize = 50;

/// Inclusive end index selecting the first `count` list entries.
///
/// Counts beyond `isize::MAX` saturate; a plain cast would wrap negative and
/// select from the tail instead.
fn last_index(count: usize) -> isize {
    isize::try_from(count).unwrap_or(isize::MAX) - 1
}

/// History errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Per-room append log over the shared store's list operations.
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn SharedStore>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_capacity(store, HISTORY_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn SharedStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
        }
    }

    pub fn key(room: &str) -> String {
        format!("chat:{room}")
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push `message` to the head of `room`'s log and trim to capacity.
    pub async fn append(&self, room: &str, message: &ChatMessage) -> Result<(), HistoryError> {
        let key = Self::key(room);
        let encoded = message.to_json()?;
        self.store.list_push(&key, &encoded).await?;
        self.store
            .list_trim(&key, 0, last_index(self.capacity))
            .await?;
        Ok(())
    }

    /// The newest `limit` messages of `room`, newest first.
    ///
    /// Entries that fail to decode are logged and skipped.
    pub async fn recent(&self, room: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .list_range(&Self::key(room), 0, last_index(limit))
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match ChatMessage::from_json(entry) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::warn!("Skipping corrupt history entry in room {room}: {e}");
                    None
                }
            })
            .collect())
    }
}
