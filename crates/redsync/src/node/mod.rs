//! Store node handles
//!
//! A node is one independent key-value backend participating in the lock
//! quorum. Each primitive must be a single atomic operation at the backend;
//! a check-then-act sequence on the client side would let two holders win
//! the same key.

mod memory;
mod redis;

pub use memory::MemoryNode;
pub use self::redis::RedisNode;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::NodeError;

/// Atomic lock primitives offered by one store backend
#[async_trait]
pub trait LockNode: Send + Sync {
    /// Display name of the node, usually its address
    fn name(&self) -> &str;

    /// Create `key = value` with the given expiry only if the key is absent.
    ///
    /// Returns `Ok(false)` when the key already exists.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError>;

    /// Delete `key` only if it currently stores `value`.
    async fn try_release(&self, key: &str, value: &str) -> Result<bool, NodeError>;

    /// Reset the expiry of `key` to `ttl` only if it currently stores `value`.
    async fn try_extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, NodeError>;
}

/// Shared handle to a node
pub type NodeRef = Arc<dyn LockNode>;

/// Expiry in whole milliseconds, never zero
pub(crate) fn ttl_millis(ttl: Duration) -> Result<u64, NodeError> {
    u64::try_from(ttl.as_millis())
        .map(|ms| ms.max(1))
        .map_err(|_| NodeError::Protocol(format!("ttl out of range: {:?}", ttl)))
}

/// Absolute expiry of a key written now with `ttl`
pub(crate) fn expires_at(ttl: Duration) -> Result<Instant, NodeError> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| NodeError::Protocol(format!("ttl out of range: {:?}", ttl)))
}
