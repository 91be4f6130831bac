use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

#[derive(Debug)]
struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Keyed reader/writer locks over `volume/path` strings. Entries exist only
/// while some caller holds or waits for them.
#[derive(Debug, Clone, Default)]
pub struct NsLockMap {
    table: LockTable,
}

#[derive(Debug)]
enum Held {
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// Releases the lock when dropped, on every exit path.
#[derive(Debug)]
pub struct NsLockGuard {
    key: String,
    table: LockTable,
    held: Option<Held>,
}

impl NsLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive lock. Not reentrant: locking a key twice from the same task
    /// deadlocks.
    pub async fn lock(&self, volume: &str, path: &str) -> NsLockGuard {
        let (mut guard, lock) = self.register(volume, path);
        guard.held = Some(Held::Write(lock.write_owned().await));
        guard
    }

    pub async fn rlock(&self, volume: &str, path: &str) -> NsLockGuard {
        let (mut guard, lock) = self.register(volume, path);
        guard.held = Some(Held::Read(lock.read_owned().await));
        guard
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, volume: &str, path: &str) -> (NsLockGuard, Arc<RwLock<()>>) {
        let key = format!("{volume}/{path}");
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = table.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(RwLock::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        // The guard exists before the await so a cancelled waiter still
        // gives its reference back.
        let guard = NsLockGuard {
            key,
            table: Arc::clone(&self.table),
            held: None,
        };
        (guard, lock)
    }
}

impl NsLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(Held::Write(_)))
    }
}

impl Drop for NsLockGuard {
    fn drop(&mut self) {
        self.held.take();

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = table.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                table.remove(&self.key);
            }
        }
    }
}
