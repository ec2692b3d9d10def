//! Lock factory
//!
//! Holds the fixed node set of one deployment and creates mutexes bound to
//! it. A factory carries no lock state and can be shared freely.

use std::sync::Arc;

use crate::error::{RedsyncError, Result};
use crate::guard::CallGuard;
use crate::mutex::Mutex;
use crate::node::NodeRef;
use crate::options::MutexOptions;

/// Number of nodes that must agree for a lock operation to succeed
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Factory for [`Mutex`] instances over a fixed set of nodes
#[derive(Clone)]
pub struct Redsync {
    nodes: Arc<[NodeRef]>,
    guard: CallGuard,
}

impl Redsync {
    /// Create a factory over `nodes`
    ///
    /// Fails if `nodes` is empty.
    pub fn new(nodes: Vec<NodeRef>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RedsyncError::InvalidArgument(
                "at least one node is required".to_string(),
            ));
        }
        Ok(Self {
            nodes: nodes.into(),
            guard: CallGuard::none(),
        })
    }

    /// Use `guard` around every node call of every mutex created afterwards
    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Serialize all node calls through one in-process critical section
    pub fn serialized(self) -> Self {
        self.with_guard(CallGuard::serialized())
    }

    /// Create a mutex named `name` bound to all nodes of this factory
    pub fn new_mutex(&self, name: impl Into<String>, opts: MutexOptions) -> Mutex {
        Mutex::new(
            name.into(),
            opts,
            quorum(self.nodes.len()),
            self.nodes.clone(),
            self.guard.clone(),
        )
    }

    pub fn quorum(&self) -> usize {
        quorum(self.nodes.len())
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }
}

impl std::fmt::Debug for Redsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redsync")
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>(),
            )
            .field("guard", &self.guard)
            .finish()
    }
}
