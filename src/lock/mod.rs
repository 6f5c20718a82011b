//! Per-id mutual exclusion.
//!
//! Each id moves through `Unlocked -> Locked(holder) -> Unlocked`. Acquisition
//! waits at most the configured timeout and then fails with `LockTimeout`.
//! Release happens when the returned [`StateLock`] is dropped, so every exit
//! path of a critical section (return, `?`, panic unwind) unlocks.
//!
//! Provides:
//! - `KeyedLockManager`: in-process locks, one slot per id
//! - `FileLockManager`: advisory lock files, shared by processes on one host
//! - `LeaseLockManager`: expiring lock rows in a SQLite database
//!
//! Locks are not reentrant. Acquiring an id twice from the same thread waits
//! for the first guard and times out.

mod file;
mod keyed;
mod lease;

pub use file::FileLockManager;
pub use keyed::KeyedLockManager;
pub use lease::LeaseLockManager;

use crate::models::Result;
use std::fmt;
use std::time::{Duration, Instant};

/// Something that can hand out per-id locks.
pub trait LockManager: Send + Sync {
    /// Block until `id` is locked by the caller or the timeout elapses.
    fn acquire(&self, id: &str) -> Result<StateLock>;
}

/// A held lock on one id. Dropping it releases the lock.
pub struct StateLock {
    id: String,
    holder: String,
    acquired_at: Instant,
    _release: Box<dyn Send>,
}

impl StateLock {
    pub(crate) fn new(id: &str, holder: String, release: impl Send + 'static) -> Self {
        Self {
            id: id.to_string(),
            holder,
            acquired_at: Instant::now(),
            _release: Box::new(release),
        }
    }

    /// The locked id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opaque token identifying this acquisition.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for StateLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLock")
            .field("id", &self.id)
            .field("holder", &self.holder)
            .field("held_for", &self.held_for())
            .finish()
    }
}

/// Fresh holder token for one acquisition.
pub(crate) fn new_holder() -> String {
    uuid::Uuid::new_v4().to_string()
}
