use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{ Mutex, OwnedMutexGuard };

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Per-key async mutexes. Work on different keys never contends.
///
/// An entry lives only while someone holds or waits for its lock.
#[derive(Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Holds the lock for one key until dropped.
pub struct KeyedGuard {
    key: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map's own reference is the only one left once nobody holds or waits.
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
