//! In-process shared store.
//!
//! Mirrors the Redis semantics the rest of the crate relies on. Several
//! server instances holding the same `Arc<MemoryStore>` behave like separate
//! processes sharing one Redis: history, presence and the fanout channel are
//! all shared, while each instance keeps its own session tables.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::{resolve_range, SharedStore, StoreError, Subscription, SUBSCRIPTION_BUFFER};

/// Pub/sub channel capacity per channel name.
const CHANNEL_CAPACITY: usize = 4096;

/// Memory-backed [`SharedStore`].
pub struct MemoryStore {
    lists: RwLock<HashMap<String, VecDeque<String>>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    /// When false every operation fails with `Unavailable`
    available: AtomicBool,
    published: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Simulate a backend outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Raw list length, including entries past any trim bound.
    pub async fn list_len(&self, key: &str) -> usize {
        self.lists.read().await.get(key).map_or(0, |l| l.len())
    }

    /// Total payloads published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut lists = self.lists.write().await;
        lists.entry(key.to_string()).or_default().push_front(value.to_string());
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: isize, end: isize) -> Result<(), StoreError> {
        self.check()?;
        let mut lists = self.lists.write().await;
        let Some(list) = lists.get_mut(key) else {
            return Ok(());
        };
        match resolve_range(list.len(), start, end) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => {
                lists.remove(key);
            }
        }
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let lists = self.lists.read().await;
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, end) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut sets = self.sets.write().await;
        sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(channel) {
            // No subscribers means the payload is lost, as with Redis.
            let _ = sender.send(payload.to_vec());
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check()?;
        let mut source = {
            let mut channels = self.channels.write().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber on {channel} lagged by {n} payloads");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
