//! Cluster-wide room presence.
//!
//! A room's presence set lives at `online:{room}` in the shared store and
//! holds the ids of every session joined to it on any instance. Presence is
//! bookkeeping only: history replay and fanout never consult it.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::SessionId;
use crate::store::{SharedStore, StoreError};

/// Delay before the first cleanup retry; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Per-room presence sets over the shared store's set operations.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn SharedStore>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn key(room: &str) -> String {
        format!("online:{room}")
    }

    /// Add `session` to `room`. Idempotent.
    pub async fn join(&self, room: &str, session: SessionId) -> Result<(), StoreError> {
        self.store
            .set_add(&Self::key(room), &session.to_string())
            .await
    }

    /// Remove `session` from `room`. Removing a non-member is a no-op.
    pub async fn leave(&self, room: &str, session: SessionId) -> Result<(), StoreError> {
        self.store
            .set_remove(&Self::key(room), &session.to_string())
            .await
    }

    /// `leave` with up to `attempts` tries and exponential backoff.
    ///
    /// Returns the last error once attempts are exhausted; the set may then
    /// keep a stale id.
    pub async fn leave_with_retry(
        &self,
        room: &str,
        session: SessionId,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let attempts = attempts.max(1);
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.leave(room, session).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    log::debug!(
                        "Presence leave for {session} in {room} failed (attempt {attempt}/{attempts}): {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Session ids currently present in `room`, across all instances.
    pub async fn members(&self, room: &str) -> Result<Vec<SessionId>, StoreError> {
        let raw = self.store.set_members(&Self::key(room)).await?;
        Ok(raw
            .iter()
            .filter_map(|id| match id.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    log::warn!("Ignoring malformed presence entry {id:?} in room {room}");
                    None
                }
            })
            .collect())
    }

    pub async fn count(&self, room: &str) -> Result<usize, StoreError> {
        Ok(self.store.set_members(&Self::key(room)).await?.len())
    }

    pub async fn contains(&self, room: &str, session: SessionId) -> Result<bool, StoreError> {
        Ok(self.members(room).await?.contains(&session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn registry() -> (PresenceRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PresenceRegistry::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (presence, _) = registry();
        let s = Uuid::new_v4();
        presence.join("general", s).await.unwrap();
        presence.join("general", s).await.unwrap();
        assert_eq!(presence.count("general").await.unwrap(), 1);
        assert!(presence.contains("general", s).await.unwrap());
    }

    #[tokio::test]
    async fn test_join_then_leave_restores_set() {
        let (presence, _) = registry();
        let existing = Uuid::new_v4();
        presence.join("general", existing).await.unwrap();
        let before = presence.members("general").await.unwrap();

        let s = Uuid::new_v4();
        presence.join("general", s).await.unwrap();
        presence.leave("general", s).await.unwrap();

        assert_eq!(presence.members("general").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_leave_non_member_is_noop() {
        let (presence, _) = registry();
        presence.leave("nowhere", Uuid::new_v4()).await.unwrap();
        assert_eq!(presence.count("nowhere").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leave_with_retry_gives_up() {
        let (presence, store) = registry();
        store.set_available(false);
        let result = presence.leave_with_retry("r", Uuid::new_v4(), 2).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_leave_with_retry_recovers() {
        let (presence, store) = registry();
        let s = Uuid::new_v4();
        presence.join("r", s).await.unwrap();
        store.set_available(false);

        let restore = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.set_available(true);
            })
        };

        presence.leave_with_retry("r", s, 5).await.unwrap();
        restore.await.unwrap();
        assert!(!presence.contains("r", s).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_member_skipped() {
        let (presence, store) = registry();
        store.set_add(&PresenceRegistry::key("r"), "not-a-uuid").await.unwrap();
        let s = Uuid::new_v4();
        presence.join("r", s).await.unwrap();
        assert_eq!(presence.members("r").await.unwrap(), vec![s]);
    }
}
