//! Redsync - distributed mutual exclusion over a quorum of key-value nodes
//!
//! This crate implements the Redlock algorithm:
//! - Node handles with atomic create/delete/refresh primitives (Redis, in-memory)
//! - A lock factory deriving the quorum from its node set
//! - A mutex driving acquire/retry/release/extend with drift compensation
//! - Blocking and non-blocking option presets
//! - An optional guard serializing calls to a shared non-thread-safe connection
//! - File/environment configuration
//! - Scripted nodes for testing code that takes locks
//!
//! ```no_run
//! use redsync::{MutexOptions, RedsyncConfig};
//!
//! # async fn run() -> redsync::Result<()> {
//! let rs = RedsyncConfig::load(Some("conf/redsync.yml"))?.connect().await?;
//! let mut mutex = rs.new_mutex("billing-job", MutexOptions::blocking());
//!
//! match mutex.lock().await {
//!     Ok(()) => {
//!         // critical section
//!         mutex.unlock().await;
//!     }
//!     Err(err) if err.is_contention() => println!("held elsewhere"),
//!     Err(err) => return Err(err),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod guard;
pub mod mutex;
pub mod node;
pub mod options;
pub mod testing;

// Re-exports for convenience
pub use crate::config::RedsyncConfig;
pub use error::{NodeError, RedsyncError, Result};
pub use factory::{Redsync, quorum};
pub use guard::CallGuard;
pub use mutex::Mutex;
pub use node::{LockNode, MemoryNode, NodeRef, RedisNode};
pub use options::{MutexOptions, Profile};

// Callers of `Mutex::lock_with_cancel` need the token type
pub use tokio_util::sync::CancellationToken;
