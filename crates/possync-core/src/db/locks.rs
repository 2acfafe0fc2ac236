//! Per-entity write locks
//!
//! The local write path and the sync cycle both mutate a record together with
//! its operations. Those read-modify-write sequences are serialized per
//! `RecordKey`; writers of unrelated entities never wait on each other and
//! readers take no entity lock at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::RecordKey;

#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the write lock for `key`.
    ///
    /// Must not be called with `f` awaiting; the guard is a blocking mutex.
    pub fn with_entity<T>(&self, key: &RecordKey, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let value = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        self.release(key, &lock);
        value
    }

    /// Drop the map entry once no other holder or waiter references it
    fn release(&self, key: &RecordKey, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller
        if Arc::strong_count(lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Number of entities with a live lock entry
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn key(id: &str) -> RecordKey {
        RecordKey::new(TenantId::new("t").unwrap(), "order", id).unwrap()
    }

    #[test]
    fn entries_are_released_after_use() {
        let locks = EntityLocks::new();
        let value = locks.with_entity(&key("1"), || 7);
        assert_eq!(value, 7);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn same_entity_writers_are_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    locks.with_entity(&key("42"), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn different_entities_do_not_block_each_other() {
        let locks = Arc::new(EntityLocks::new());
        let (tx, rx) = std::sync::mpsc::channel();

        let locks_a = Arc::clone(&locks);
        let holder = thread::spawn(move || {
            locks_a.with_entity(&key("a"), || {
                // Held until the other entity's writer has finished
                rx.recv_timeout(Duration::from_secs(5)).unwrap();
            });
        });

        locks.with_entity(&key("b"), || ());
        tx.send(()).unwrap();
        holder.join().unwrap();
    }
}
