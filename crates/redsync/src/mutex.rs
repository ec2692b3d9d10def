//! Distributed mutex: the Redlock acquisition, release and extension protocol
//!
//! A lock is held when a majority of nodes store the mutex's owner token
//! under its name. The validity window handed back to the caller is the
//! requested expiry minus the time spent acquiring and a drift allowance
//! proportional to the expiry, so a slow quorum round never reports a lease
//! that has already lapsed at the fastest node.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::FutureExt;
use rand::TryRngCore;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RedsyncError, Result};
use crate::guard::CallGuard;
use crate::node::NodeRef;
use crate::options::{MutexOptions, check_expiry};

/// Residual timer-resolution allowance added to every validity window
const CLOCK_SAFETY_MARGIN: Duration = Duration::from_millis(2);

/// Owner token length in random bytes
const TOKEN_BYTES: usize = 32;

/// A distributed mutual exclusion lock
///
/// A `Mutex` is not meant to be shared: every concurrent lock attempt needs
/// its own instance. The factory that created it is cheap to clone and may
/// be shared by any number of tasks.
pub struct Mutex {
    name: String,
    expiry: Duration,
    tries: u32,
    delay: Duration,
    factor: f64,
    quorum: usize,
    value: String,
    until: Option<Instant>,
    nodes: Arc<[NodeRef]>,
    guard: CallGuard,
}

impl Mutex {
    pub(crate) fn new(
        name: String,
        opts: MutexOptions,
        quorum: usize,
        nodes: Arc<[NodeRef]>,
        guard: CallGuard,
    ) -> Self {
        Self {
            name,
            expiry: opts.expiry,
            tries: opts.tries,
            delay: opts.delay,
            factor: opts.factor,
            quorum,
            value: String::new(),
            until: None,
            nodes,
            guard,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner token of the current hold, empty when not held
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Deadline after which the lock must be considered lost
    pub fn until(&self) -> Option<Instant> {
        self.until
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn options(&self) -> MutexOptions {
        MutexOptions {
            expiry: self.expiry,
            tries: self.tries,
            delay: self.delay,
            factor: self.factor,
        }
    }

    /// Acquire the lock.
    ///
    /// `Ok(())` means the lock is held until [`Mutex::until`]; callers should
    /// make sure [`Mutex::unlock`] is called afterwards. `Err(RedsyncError::Failed)`
    /// means another holder has it and the caller may retry later. Any other
    /// error is unexpected, like a node being unreachable.
    pub async fn lock(&mut self) -> Result<()> {
        self.acquire(None).await
    }

    /// Acquire the lock, giving up with `RedsyncError::Cancelled` once
    /// `cancel` fires
    pub async fn lock_with_cancel(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.acquire(Some(cancel)).await
    }

    /// Release the lock, returning whether a quorum of nodes released it
    pub async fn unlock(&mut self) -> bool {
        if self.value.is_empty() {
            warn!(name = %self.name, "Unlock called on a mutex that is not held");
            metrics::counter!("redsync_unlock_total", "outcome" => "not_held").increment(1);
            return false;
        }

        let value = std::mem::take(&mut self.value);
        self.until = None;

        let released = self.release_all(&value).await;
        let ok = released >= self.quorum;
        debug!(
            name = %self.name,
            released,
            quorum = self.quorum,
            "Lock released"
        );
        metrics::counter!(
            "redsync_unlock_total",
            "outcome" => if ok { "released" } else { "below_quorum" }
        )
        .increment(1);
        ok
    }

    /// Reset the lease to the full expiry on every node still holding the
    /// owner token, returning whether a quorum accepted
    ///
    /// Also returns `false` when a quorum refreshed the key but the round took
    /// too long to leave a validity window. The nodes keep the refreshed
    /// lease in that case while [`Mutex::until`] stays unchanged.
    pub async fn extend(&mut self) -> bool {
        if self.value.is_empty() {
            return false;
        }

        let start = Instant::now();
        let extended = self.extend_all(&self.value).await;
        if extended < self.quorum {
            debug!(
                name = %self.name,
                extended,
                quorum = self.quorum,
                "Lock extension below quorum"
            );
            metrics::counter!("redsync_extend_total", "outcome" => "below_quorum").increment(1);
            return false;
        }

        match self.validity_deadline(start) {
            Some(until) => {
                self.until = Some(until);
                metrics::counter!("redsync_extend_total", "outcome" => "extended").increment(1);
                true
            }
            None => {
                metrics::counter!("redsync_extend_total", "outcome" => "expired").increment(1);
                false
            }
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// Returns `Ok(None)` without invoking `f` when the lock is held
    /// elsewhere, and `Err` only for unexpected failures. The lock is always
    /// released after `f` finishes, including when it panics.
    pub async fn with_lock<F, Fut, T>(&mut self, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.lock().await {
            Ok(()) => {}
            Err(RedsyncError::Failed) => return Ok(None),
            Err(err) => return Err(err),
        }

        let outcome = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await;
        self.unlock().await;

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn acquire(&mut self, cancel: Option<&CancellationToken>) -> Result<()> {
        if self.name.is_empty() {
            return Err(RedsyncError::InvalidArgument(
                "mutex name must not be empty".to_string(),
            ));
        }
        check_expiry(self.expiry)?;

        let value = generate_token()?;
        let started = Instant::now();

        for attempt in 0..self.tries {
            if attempt != 0 {
                match cancel {
                    Some(cancel) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(RedsyncError::Cancelled);
                            }
                            _ = tokio::time::sleep(self.delay) => {}
                        }
                    }
                    None => tokio::time::sleep(self.delay).await,
                }
            }

            let start = Instant::now();
            let acquired = match self.acquire_all(&value, cancel).await {
                Ok(acquired) => acquired,
                Err(err) => {
                    self.release_all(&value).await;
                    metrics::counter!("redsync_lock_attempts_total", "outcome" => "error")
                        .increment(1);
                    return Err(err);
                }
            };

            if acquired >= self.quorum
                && let Some(until) = self.validity_deadline(start)
            {
                self.value = value;
                self.until = Some(until);
                debug!(
                    name = %self.name,
                    attempt,
                    acquired,
                    quorum = self.quorum,
                    "Lock acquired"
                );
                metrics::counter!("redsync_lock_attempts_total", "outcome" => "acquired")
                    .increment(1);
                metrics::histogram!("redsync_lock_acquire_seconds")
                    .record(started.elapsed().as_secs_f64());
                return Ok(());
            }

            debug!(
                name = %self.name,
                attempt,
                acquired,
                quorum = self.quorum,
                "Lock attempt failed"
            );
            self.release_all(&value).await;
        }

        metrics::counter!("redsync_lock_attempts_total", "outcome" => "contention").increment(1);
        Err(RedsyncError::Failed)
    }

    /// Deadline of a round that started at `start`, or `None` if the lease
    /// already lapsed or the window cannot be represented
    fn validity_deadline(&self, start: Instant) -> Option<Instant> {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(start);
        let spent = elapsed.checked_add(self.drift()?)?;
        let validity = self
            .expiry
            .checked_add(CLOCK_SAFETY_MARGIN)?
            .checked_sub(spent)?;
        let until = now.checked_add(validity)?;
        (Instant::now() < until).then_some(until)
    }

    /// Drift allowance `expiry * factor`; `None` for a negative, NaN or
    /// unrepresentable product
    fn drift(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.expiry.as_secs_f64() * self.factor).ok()
    }

    /// Try every node in order; the first node error aborts the round
    async fn acquire_all(&self, value: &str, cancel: Option<&CancellationToken>) -> Result<usize> {
        let mut acquired = 0;
        for node in self.nodes.iter() {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(RedsyncError::Cancelled);
            }
            let granted = self
                .guard
                .run(node.try_acquire(&self.name, value, self.expiry))
                .await
                .map_err(|source| {
                    warn!(
                        name = %self.name,
                        node = %node.name(),
                        error = %source,
                        "Node failed during lock acquisition"
                    );
                    RedsyncError::Node {
                        node: node.name().to_string(),
                        source,
                    }
                })?;
            if granted {
                acquired += 1;
            }
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(RedsyncError::Cancelled);
        }
        Ok(acquired)
    }

    /// Best-effort delete on every node; errors count as not released
    async fn release_all(&self, value: &str) -> usize {
        let mut released = 0;
        for node in self.nodes.iter() {
            match self.guard.run(node.try_release(&self.name, value)).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => {
                    debug!(
                        name = %self.name,
                        node = %node.name(),
                        error = %err,
                        "Ignoring node error during release"
                    );
                }
            }
        }
        released
    }

    /// Best-effort expiry refresh on every node; errors count as not extended
    async fn extend_all(&self, value: &str) -> usize {
        let mut extended = 0;
        for node in self.nodes.iter() {
            match self
                .guard
                .run(node.try_extend(&self.name, value, self.expiry))
                .await
            {
                Ok(true) => extended += 1,
                Ok(false) => {}
                Err(err) => {
                    debug!(
                        name = %self.name,
                        node = %node.name(),
                        error = %err,
                        "Ignoring node error during extend"
                    );
                }
            }
        }
        extended
    }
}

impl std::fmt::Display for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "redsync.Mutex{{name: {}, tries: {}, expiry: {:?}, nodes: {}}}",
            self.name,
            self.tries,
            self.expiry,
            self.nodes.len()
        )
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("expiry", &self.expiry)
            .field("tries", &self.tries)
            .field("delay", &self.delay)
            .field("factor", &self.factor)
            .field("quorum", &self.quorum)
            .field("held", &!self.value.is_empty())
            .field("until", &self.until)
            .finish()
    }
}

/// 32 bytes from the OS random source, base64 encoded
fn generate_token() -> Result<String> {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| RedsyncError::Token(e.to_string()))?;
    Ok(STANDARD.encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Redsync;
    use crate::node::MemoryNode;

    fn single_node() -> (Arc<MemoryNode>, Redsync) {
        let node = Arc::new(MemoryNode::new("mem-0"));
        let rs = Redsync::new(vec![node.clone() as NodeRef]).unwrap();
        (node, rs)
    }

    #[test]
    fn test_generate_token() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), 44);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), TOKEN_BYTES);
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        let (_, rs) = single_node();
        let mutex = rs.new_mutex("example-new", MutexOptions::non_blocking());
        assert_eq!(
            mutex.to_string(),
            "redsync.Mutex{name: example-new, tries: 1, expiry: 8s, nodes: 1}"
        );
    }

    #[test]
    fn test_validity_deadline_subtracts_drift() {
        let (_, rs) = single_node();
        let opts = MutexOptions::non_blocking()
            .with_expiry(Duration::from_secs(10))
            .with_factor(0.1);
        let mutex = rs.new_mutex("drift", opts);

        let start = Instant::now();
        let until = mutex.validity_deadline(start).unwrap();
        // 10s - 1s drift + 2ms margin, minus the time spent computing it
        let window = until.duration_since(start);
        assert!(window <= Duration::from_millis(9002));
        assert!(window > Duration::from_millis(8900));
    }

    #[test]
    fn test_validity_deadline_lapsed() {
        let (_, rs) = single_node();
        let opts = MutexOptions::non_blocking()
            .with_expiry(Duration::from_millis(5))
            .with_factor(0.0);
        let mutex = rs.new_mutex("lapsed", opts);

        let start = Instant::now() - Duration::from_millis(50);
        assert!(mutex.validity_deadline(start).is_none());
    }

    #[test]
    fn test_unrepresentable_drift_leaves_no_window() {
        let (_, rs) = single_node();
        for factor in [1e300, f64::INFINITY, f64::NAN, -0.5, 2.0] {
            let mutex = rs.new_mutex("drift", MutexOptions::non_blocking().with_factor(factor));
            assert!(
                mutex.validity_deadline(Instant::now()).is_none(),
                "factor {}",
                factor
            );
        }
    }

    #[tokio::test]
    async fn test_huge_drift_factor_is_contention() {
        let (node, rs) = single_node();
        let mut mutex = rs.new_mutex("drift", MutexOptions::non_blocking().with_factor(1e300));

        let err = mutex.lock().await.unwrap_err();
        assert!(err.is_contention());
        assert!(mutex.until().is_none());
        // The grant was rolled back
        assert!(node.get("drift").is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_rejected() {
        let (node, rs) = single_node();
        for expiry in [Duration::ZERO, Duration::from_secs(u64::MAX)] {
            let mut mutex = rs.new_mutex("huge", MutexOptions::non_blocking().with_expiry(expiry));
            let err = mutex.lock().await.unwrap_err();
            assert!(matches!(err, RedsyncError::InvalidArgument(_)));
        }
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn test_extend_without_window_keeps_until() {
        let (node, rs) = single_node();
        let mut mutex = rs.new_mutex("refreshed", MutexOptions::non_blocking());
        mutex.lock().await.unwrap();
        let until = mutex.until();

        // A drift larger than the lease leaves no window after extending
        mutex.factor = 2.0;
        assert!(!mutex.extend().await);
        assert_eq!(mutex.until(), until);
        // The nodes still hold the refreshed lease
        assert_eq!(node.get("refreshed").as_deref(), Some(mutex.value()));
        assert!(node.pttl("refreshed").is_some());
    }

    #[tokio::test]
    async fn test_lock_sets_value_and_until() {
        let (node, rs) = single_node();
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking());

        mutex.lock().await.unwrap();
        assert!(!mutex.value().is_empty());
        assert!(mutex.until().unwrap() > Instant::now());
        assert_eq!(node.get("resource").as_deref(), Some(mutex.value()));

        assert!(mutex.unlock().await);
        assert!(mutex.value().is_empty());
        assert!(mutex.until().is_none());
        assert!(node.get("resource").is_none());
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let (node, rs) = single_node();
        node.set("resource", "");
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking());

        assert!(!mutex.unlock().await);
        // An empty token must never match a stored key
        assert_eq!(node.get("resource").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_double_unlock() {
        let (_, rs) = single_node();
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking());

        mutex.lock().await.unwrap();
        assert!(mutex.unlock().await);
        assert!(!mutex.unlock().await);
    }

    #[tokio::test]
    async fn test_extend_without_lock() {
        let (_, rs) = single_node();
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking());
        assert!(!mutex.extend().await);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (_, rs) = single_node();
        let mut mutex = rs.new_mutex("", MutexOptions::non_blocking());
        let err = mutex.lock().await.unwrap_err();
        assert!(matches!(err, RedsyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_zero_tries_is_contention() {
        let (node, rs) = single_node();
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking().with_tries(0));

        let err = mutex.lock().await.unwrap_err();
        assert!(err.is_contention());
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn test_relock_after_unlock_uses_fresh_token() {
        let (_, rs) = single_node();
        let mut mutex = rs.new_mutex("resource", MutexOptions::non_blocking());

        mutex.lock().await.unwrap();
        let first = mutex.value().to_string();
        mutex.unlock().await;

        mutex.lock().await.unwrap();
        assert_ne!(mutex.value(), first);
        mutex.unlock().await;
    }
}
