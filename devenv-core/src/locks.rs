//! Per-key exclusive locks.
//!
//! Operations on the same environment id are serialized through one async
//! mutex per key; different keys never contend. Entries are created on demand
//! and removed once no guard or waiter references them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Table,
}

/// Holds the lock for one key until dropped.
pub struct KeyedGuard {
    key: String,
    table: Table,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for KeyedGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGuard").field("key", &self.key).finish()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the table, one inside our own guard.
        if table
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) <= 2)
        {
            table.remove(&self.key);
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until the key is free and take it.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            table: self.table.clone(),
            _guard: guard,
        }
    }

    /// Take the key only if nobody holds it right now.
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mutex = self.entry(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key: key.to_string(),
                table: self.table.clone(),
                _guard: guard,
            }),
            Err(_) => None,
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get(key).is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of keys currently tracked (held or awaited).
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
