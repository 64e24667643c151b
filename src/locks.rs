//! Per-referee serialization.
//!
//! Events for the same user queue behind one async mutex; events for
//! different users never contend beyond the brief table lookup. Tokio's
//! mutex is FIFO, so waiters run in the order they arrived. Entries are
//! dropped from the table once nobody holds or awaits them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::UserId;

#[derive(Default)]
pub struct KeyedLocks {
    table: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<UserId, Arc<AsyncMutex<()>>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: UserId) -> KeyGuard<'_> {
        let entry = self.table().entry(key).or_default().clone();
        let guard = entry.clone().lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            entry,
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.table().len()
    }
}

pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: UserId,
    entry: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release before inspecting the count: the owned guard holds a clone.
        self.guard.take();
        let mut table = self.locks.table();
        // One reference in the table, one here. Clones are only taken under
        // the table lock, so nobody can start waiting after this check.
        if Arc::strong_count(&self.entry) == 2 {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn table_is_emptied_after_release() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock(UserId(1)).await;
            let _b = locks.lock(UserId(2)).await;
            assert_eq!(locks.active(), 2);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(UserId(7)).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn waiters_run_in_arrival_order() {
        let locks = Arc::new(KeyedLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = locks.lock(UserId(3)).await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(UserId(3)).await;
                order.lock().unwrap().push(i);
            }));
            // Let the task enqueue before spawning the next one.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
