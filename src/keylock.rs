use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyGuard {
    #[allow(dead_code)]
    key: String,
    _guard: OwnedMutexGuard<()>,
}

/// Async mutex per string key. Prevents same-key operations from interleaving.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let arc = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = arc.lock_owned().await;
        // opportunistic cleanup: drop entries nobody holds or waits on
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        KeyGuard { key: key.to_string(), _guard: guard }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
