//! In-memory implementation of StateStore.
//!
//! Records live in a map inside this process. Useful for testing and for
//! single-process runs that do not need state to outlive the process.

use super::{BackendKind, IdPattern, StateIds, StateStore};
use crate::lock::{KeyedLockManager, LockManager, StateLock};
use crate::models::{LockConfig, Result, StateRecord, merge, validate_id};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory store. Clones share the same records and locks.
#[derive(Clone)]
pub struct MemoryStateStore {
    records: Arc<RwLock<HashMap<String, StateRecord>>>,
    locks: KeyedLockManager,
}

impl MemoryStateStore {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            locks: KeyedLockManager::new(config),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

impl StateStore for MemoryStateStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn set(&self, record: StateRecord) -> Result<()> {
        validate_id(&record.id)?;

        if record.complete {
            debug!(id = %record.id, "Writing complete state");
            self.records.write().insert(record.id.clone(), record);
            return Ok(());
        }

        let _lock = self.locks.acquire(&record.id)?;
        let existing = self.records.read().get(&record.id).cloned();
        let merged = merge(existing.as_ref(), record);
        debug!(id = %merged.id, fields = merged.payload.len(), "Merged partial state");
        self.records.write().insert(merged.id.clone(), merged);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        validate_id(id)?;
        Ok(self.records.read().get(id).cloned())
    }

    fn clear(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        if self.records.write().remove(id).is_some() {
            debug!(id = %id, "Cleared state");
        }
        Ok(())
    }

    fn list(&self, pattern: Option<&str>) -> Result<StateIds> {
        let pattern = IdPattern::new(pattern)?;
        let candidates = self
            .records
            .read()
            .keys()
            .filter(|id| id.starts_with(pattern.prefix()))
            .cloned()
            .collect();
        Ok(StateIds::new(candidates, pattern))
    }

    fn acquire_lock(&self, id: &str) -> Result<StateLock> {
        validate_id(id)?;
        self.locks.acquire(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_records() {
        let store = MemoryStateStore::default();
        let other = store.clone();

        store
            .set(StateRecord::from_json("job", json!({"a": 1}), false).unwrap())
            .unwrap();
        assert_eq!(other.len(), 1);
        assert!(other.get("job").unwrap().is_some());
    }

    #[test]
    fn test_partial_write_blocks_while_caller_holds_lock() {
        let store = MemoryStateStore::new(&LockConfig {
            timeout_secs: 0,
            ..LockConfig::default()
        });

        let _held = store.acquire_lock("job").unwrap();
        let err = store
            .set(StateRecord::from_json("job", json!({"a": 1}), false).unwrap())
            .unwrap_err();
        assert!(err.is_retryable());

        // complete writes do not take the lock
        store
            .set(StateRecord::from_json("job", json!({"a": 2}), true).unwrap())
            .unwrap();
    }
}
