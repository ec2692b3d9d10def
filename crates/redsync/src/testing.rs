//! Helpers for testing code that takes locks, without running real stores
//!
//! [`ScriptedNode`] replays queued outcomes for each primitive, and
//! [`shared_nodes`] turns one scripted connection into any number of node
//! handles.
//!
//! ```
//! use std::sync::Arc;
//! use redsync::testing::{Outcome, ScriptedNode, shared_nodes};
//! use redsync::{MutexOptions, Redsync};
//!
//! # tokio_test_runtime(async {
//! let conn = Arc::new(ScriptedNode::new("scripted"));
//! conn.expect_acquire([Outcome::Granted, Outcome::NotGranted]);
//!
//! let rs = Redsync::new(shared_nodes(&conn, 1)).unwrap();
//! let mut first = rs.new_mutex("job", MutexOptions::non_blocking());
//! assert!(first.lock().await.is_ok());
//! let mut second = rs.new_mutex("job", MutexOptions::non_blocking());
//! assert!(second.lock().await.unwrap_err().is_contention());
//! # });
//! # fn tokio_test_runtime(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::node::{LockNode, NodeRef};

/// Scripted reply to one primitive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Granted,
    NotGranted,
    Error(String),
}

impl Outcome {
    fn into_result(self) -> Result<bool, NodeError> {
        match self {
            Outcome::Granted => Ok(true),
            Outcome::NotGranted => Ok(false),
            Outcome::Error(message) => Err(NodeError::Protocol(message)),
        }
    }
}

#[derive(Default)]
struct Script {
    acquire: VecDeque<Outcome>,
    release: VecDeque<Outcome>,
    extend: VecDeque<Outcome>,
}

/// A node connection that replays queued outcomes
///
/// The connection models a transport that must not be used from two calls
/// at once: overlapping calls are counted, see [`ScriptedNode::overlaps`].
pub struct ScriptedNode {
    name: String,
    script: Mutex<Script>,
    permissive: bool,
    latency: Duration,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedNode {
    /// Node that fails every call with no queued outcome
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(Script::default()),
            permissive: false,
            latency: Duration::ZERO,
            in_flight: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Node that grants every call with no queued outcome
    pub fn permissive(name: impl Into<String>) -> Self {
        Self {
            permissive: true,
            ..Self::new(name)
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn expect_acquire(&self, outcomes: impl IntoIterator<Item = Outcome>) -> &Self {
        self.script.lock().acquire.extend(outcomes);
        self
    }

    pub fn expect_release(&self, outcomes: impl IntoIterator<Item = Outcome>) -> &Self {
        self.script.lock().release.extend(outcomes);
        self
    }

    pub fn expect_extend(&self, outcomes: impl IntoIterator<Item = Outcome>) -> &Self {
        self.script.lock().extend.extend(outcomes);
        self
    }

    /// Number of calls that started while another call was in flight
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Total number of primitive calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Outcomes still queued for acquire
    pub fn pending_acquires(&self) -> usize {
        self.script.lock().acquire.len()
    }

    async fn replay(
        &self,
        command: &str,
        pick: fn(&mut Script) -> &mut VecDeque<Outcome>,
    ) -> Result<bool, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = pick(&mut self.script.lock()).pop_front();
        self.in_flight.store(false, Ordering::SeqCst);

        match next {
            Some(outcome) => outcome.into_result(),
            None if self.permissive => Ok(true),
            None => Err(NodeError::Protocol(format!(
                "no expectation registered for {}",
                command
            ))),
        }
    }
}

#[async_trait]
impl LockNode for ScriptedNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, NodeError> {
        self.replay("acquire", |s| &mut s.acquire).await
    }

    async fn try_release(&self, _key: &str, _value: &str) -> Result<bool, NodeError> {
        self.replay("release", |s| &mut s.release).await
    }

    async fn try_extend(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, NodeError> {
        self.replay("extend", |s| &mut s.extend).await
    }
}

/// `n` node handles that all use the same connection
pub fn shared_nodes<N>(node: &Arc<N>, n: usize) -> Vec<NodeRef>
where
    N: LockNode + 'static,
{
    (0..n).map(|_| node.clone() as NodeRef).collect()
}
