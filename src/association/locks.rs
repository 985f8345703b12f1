use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::command::CommandKey;

/// One async mutex per command record.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<CommandKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`. Access ends when the guard drops.
    pub async fn lock(&self, key: &CommandKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        lock.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
