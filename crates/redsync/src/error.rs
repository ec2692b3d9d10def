//! Error types for redsync
//!
//! `RedsyncError::Failed` is the contention sentinel: the lock is held
//! elsewhere and the caller may retry later. Every other variant is an
//! unexpected failure.

/// Failure reported by a single store node
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Application-level error for lock operations
#[derive(Debug, thiserror::Error)]
pub enum RedsyncError {
    #[error("redsync: failed to acquire lock")]
    Failed,

    #[error("redsync: node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error("redsync: failed to generate owner token: {0}")]
    Token(String),

    #[error("redsync: lock acquisition cancelled")]
    Cancelled,

    #[error("redsync: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RedsyncError {
    /// True when the lock could not be acquired because another holder has it
    pub fn is_contention(&self) -> bool {
        matches!(self, RedsyncError::Failed)
    }
}

pub type Result<T> = std::result::Result<T, RedsyncError>;
