// In-process store node
// Keys expire lazily on access; an optional background task purges them

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tracing::debug;

use super::{LockNode, expires_at};
use crate::error::NodeError;

/// A stored value with an optional expiry
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// In-memory key-value node using DashMap
///
/// Every primitive runs under the map's per-key entry lock, which makes it
/// atomic with respect to concurrent callers.
pub struct MemoryNode {
    name: String,
    entries: Arc<DashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Spawn a background task that purges expired keys every `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_sweeper(self, interval: Duration) -> Self {
        let entries = Arc::downgrade(&self.entries);
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Stop once the node is dropped
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let purged = purge(&entries);
                if purged > 0 {
                    debug!(node = %name, count = purged, "Purged expired keys");
                }
            }
        });
        self
    }

    /// Current value of `key`, if present and not expired
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of `key`
    ///
    /// `None` when the key is absent or has no expiry.
    pub fn pttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key).filter(|entry| !entry.is_expired())?;
        entry
            .expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }

    /// Store `key = value` unconditionally, without expiry
    pub fn set(&self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Make every primitive fail with `NodeError::Unavailable` while `false`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop all expired keys, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), NodeError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::Unavailable(self.name.clone()))
        }
    }
}

fn purge(entries: &DashMap<String, Entry>) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired());
    before.saturating_sub(entries.len())
}

#[async_trait]
impl LockNode for MemoryNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError> {
        self.check_available()?;

        let fresh = Entry {
            value: value.to_string(),
            expires_at: Some(expires_at(ttl)?),
        };

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn try_release(&self, key: &str, value: &str) -> Result<bool, NodeError> {
        self.check_available()?;

        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.is_expired() && entry.value == value);
        Ok(removed.is_some())
    }

    async fn try_extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError> {
        self.check_available()?;
        let deadline = expires_at(ttl)?;

        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() && entry.value == value => {
                entry.expires_at = Some(deadline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
