//! In-process keyed locks.
//!
//! One slot per currently-contended id, kept in a sharded map so unrelated
//! ids never wait on each other. A slot is dropped from the map as soon as
//! nobody holds or waits on it.

use super::{LockManager, StateLock, new_holder};
use crate::models::{LockConfig, Result, TidemarkError};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Default)]
struct Slot {
    holder: Mutex<Option<String>>,
    released: Condvar,
}

/// In-process lock manager.
#[derive(Clone)]
pub struct KeyedLockManager {
    slots: Arc<DashMap<String, Arc<Slot>>>,
    timeout: Duration,
}

impl KeyedLockManager {
    pub fn new(config: &LockConfig) -> Self {
        Self::with_timeout(config.timeout())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Check if an id is currently locked.
    pub fn is_locked(&self, id: &str) -> bool {
        self.holder(id).is_some()
    }

    /// Current holder token for an id, if locked.
    pub fn holder(&self, id: &str) -> Option<String> {
        let slot = self.slots.get(id).map(|s| Arc::clone(s.value()))?;
        let holder = slot.holder.lock().clone();
        holder
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        Arc::clone(
            self.slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Slot::default()))
                .value(),
        )
    }
}

impl LockManager for KeyedLockManager {
    fn acquire(&self, id: &str) -> Result<StateLock> {
        let slot = self.slot(id);
        let started = Instant::now();
        let deadline = started + self.timeout;
        let token = new_holder();

        {
            let mut holder = slot.holder.lock();
            while holder.is_some() {
                if slot.released.wait_until(&mut holder, deadline).timed_out() && holder.is_some() {
                    drop(holder);
                    let waited = started.elapsed();
                    // release our reference before pruning
                    drop(slot);
                    prune(&self.slots, id);
                    warn!(id = %id, waited_ms = waited.as_millis() as u64, "Lock wait timed out");
                    return Err(TidemarkError::LockTimeout {
                        id: id.to_string(),
                        waited,
                    });
                }
            }
            *holder = Some(token.clone());
        }

        debug!(id = %id, holder = %token, "Lock acquired");
        let release = KeyedRelease {
            id: id.to_string(),
            slot: Some(slot),
            slots: Arc::clone(&self.slots),
        };
        Ok(StateLock::new(id, token, release))
    }
}

struct KeyedRelease {
    id: String,
    slot: Option<Arc<Slot>>,
    slots: Arc<DashMap<String, Arc<Slot>>>,
}

impl Drop for KeyedRelease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            *slot.holder.lock() = None;
            slot.released.notify_one();
        }
        prune(&self.slots, &self.id);
        debug!(id = %self.id, "Lock released");
    }
}

/// Remove a slot nobody holds or waits on.
fn prune(slots: &DashMap<String, Arc<Slot>>, id: &str) {
    slots.remove_if(id, |_, slot| Arc::strong_count(slot) == 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let manager = KeyedLockManager::with_timeout(Duration::from_millis(50));

        let lock = manager.acquire("job-a").unwrap();
        assert!(manager.is_locked("job-a"));
        assert_eq!(manager.holder("job-a").as_deref(), Some(lock.holder()));

        drop(lock);
        assert!(!manager.is_locked("job-a"));
        assert!(manager.slots.is_empty());
    }

    #[test]
    fn test_second_acquire_times_out() {
        let manager = KeyedLockManager::with_timeout(Duration::from_millis(50));
        let _held = manager.acquire("job-a").unwrap();

        let err = manager.acquire("job-a").unwrap_err();
        assert!(err.is_retryable());
        match err {
            TidemarkError::LockTimeout { id, waited } => {
                assert_eq!(id, "job-a");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("Expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_distinct_ids_do_not_block() {
        let manager = KeyedLockManager::with_timeout(Duration::from_millis(50));
        let _a = manager.acquire("job-a").unwrap();
        let _b = manager.acquire("job-b").unwrap();
        assert!(manager.is_locked("job-a"));
        assert!(manager.is_locked("job-b"));
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let manager = KeyedLockManager::with_timeout(Duration::from_secs(5));
        let held = manager.acquire("job-a").unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire("job-a").map(|l| l.holder().to_string()))
        };

        thread::sleep(Duration::from_millis(30));
        let first = held.holder().to_string();
        drop(held);

        let second = waiter.join().unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let manager = KeyedLockManager::with_timeout(Duration::from_secs(10));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..20 {
                        let _lock = manager.acquire("shared").unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_panic() {
        let manager = KeyedLockManager::with_timeout(Duration::from_millis(100));

        let result = {
            let manager = manager.clone();
            thread::spawn(move || {
                let _lock = manager.acquire("job-a").unwrap();
                panic!("pipeline crashed mid-checkpoint");
            })
            .join()
        };
        assert!(result.is_err());

        assert!(manager.acquire("job-a").is_ok());
    }
}
