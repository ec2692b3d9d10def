// Serialization guard for node calls
// Lets many mutexes share a single connection that must not be used concurrently

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

/// Optional critical section wrapped around every single node call
///
/// The default guard is a no-op. A serialized guard funnels all node traffic
/// of every mutex created from one factory through one async lock.
#[derive(Clone, Default)]
pub struct CallGuard {
    lock: Option<Arc<AsyncMutex<()>>>,
}

impl CallGuard {
    /// Guard that does nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Guard that serializes every node call
    pub fn serialized() -> Self {
        Self {
            lock: Some(Arc::new(AsyncMutex::new(()))),
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    /// Run one node call inside the critical section, if any
    pub async fn run<F, T>(&self, call: F) -> T
    where
        F: Future<Output = T>,
    {
        match &self.lock {
            Some(lock) => {
                let _held = lock.lock().await;
                call.await
            }
            None => call.await,
        }
    }
}

impl std::fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard")
            .field("serialized", &self.is_serialized())
            .finish()
    }
}
