//! LMDB-backed StateStore, the reference backend.
//!
//! One LMDB environment rooted at the configured path holds a single named
//! database `state` mapping id -> encoded record. LMDB gives single-key
//! atomicity and one writer at a time per environment; the per-id lock files
//! under `<path>/locks` make partial merges safe across processes and let
//! callers hold an id across several operations.

use super::{BackendKind, ConnectionString, IdPattern, StateIds, StateStore};
use crate::lock::{FileLockManager, LockManager, StateLock};
use crate::models::{LockConfig, Result, StateRecord, TidemarkError, merge, validate_id};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

const DATABASE_NAME: &str = "state";
const LOCK_DIR: &str = "locks";

/// Default LMDB map size in MiB.
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Embedded key-value store.
pub struct LmdbStateStore {
    env: Env,
    db: Database<Str, Bytes>,
    locks: FileLockManager,
    path: PathBuf,
}

impl LmdbStateStore {
    /// Open (creating if needed) an environment at `path`.
    #[instrument(skip(config), fields(path = %path.display()))]
    pub fn open(path: &Path, map_size_mb: usize, config: &LockConfig) -> Result<Self> {
        let map_size = map_size_mb
            .max(1)
            .checked_mul(1024 * 1024)
            .ok_or_else(|| {
                TidemarkError::backend(
                    "open",
                    None,
                    format!("map size of {map_size_mb} MiB does not fit in memory addresses"),
                )
            })?;
        fs::create_dir_all(path).map_err(|e| TidemarkError::backend("open", None, e))?;

        // SAFETY: the environment is opened once per store and its files are
        // only modified through LMDB.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| TidemarkError::backend("open", None, e))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| TidemarkError::backend("open", None, e))?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(DATABASE_NAME))
            .map_err(|e| TidemarkError::backend("open", None, e))?;
        wtxn.commit()
            .map_err(|e| TidemarkError::backend("open", None, e))?;

        let locks = FileLockManager::new(&path.join(LOCK_DIR), config)?;

        info!("Opened LMDB state store");
        Ok(Self {
            env,
            db,
            locks,
            path: path.to_path_buf(),
        })
    }

    pub fn from_connection(conn: &ConnectionString, config: &LockConfig) -> Result<Self> {
        let map_size_mb = conn
            .option::<usize>("map_size_mb")?
            .unwrap_or(DEFAULT_MAP_SIZE_MB);
        Self::open(&conn.path(), map_size_mb, config)
    }

    /// Environment directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reject ids LMDB cannot use as keys.
    fn check_key(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let max = self.env.max_key_size();
        if id.len() > max {
            return Err(TidemarkError::InvalidInput(format!(
                "state id is {} bytes; the LMDB backend accepts at most {max}",
                id.len()
            )));
        }
        Ok(())
    }

    /// Store raw bytes for an id, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(id, e))?;
        self.db.put(&mut wtxn, id, bytes).map_err(|e| write_err(id, e))?;
        wtxn.commit().map_err(|e| write_err(id, e))
    }
}

fn write_err(id: &str, err: heed::Error) -> TidemarkError {
    TidemarkError::backend("writing state", Some(id), err)
}

impl StateStore for LmdbStateStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn set(&self, record: StateRecord) -> Result<()> {
        self.check_key(&record.id)?;
        let id = record.id.clone();

        if record.complete {
            let bytes = record.encode()?;
            let mut wtxn = self.env.write_txn().map_err(|e| write_err(&id, e))?;
            self.db
                .put(&mut wtxn, &id, &bytes)
                .map_err(|e| write_err(&id, e))?;
            wtxn.commit().map_err(|e| write_err(&id, e))?;
            debug!(id = %id, "Wrote complete state");
            return Ok(());
        }

        let _lock = self.locks.acquire(&id)?;
        let mut wtxn = self.env.write_txn().map_err(|e| write_err(&id, e))?;
        let existing = self
            .db
            .get(&wtxn, &id)
            .map_err(|e| write_err(&id, e))?
            .map(|bytes| StateRecord::decode(&id, bytes))
            .transpose()?;

        let merged = merge(existing.as_ref(), record);
        let bytes = merged.encode()?;
        self.db
            .put(&mut wtxn, &id, &bytes)
            .map_err(|e| write_err(&id, e))?;
        wtxn.commit().map_err(|e| write_err(&id, e))?;

        debug!(id = %id, fields = merged.payload.len(), "Merged partial state");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        self.check_key(id)?;
        let read_err = |e: heed::Error| TidemarkError::backend("reading state", Some(id), e);
        let rtxn = self.env.read_txn().map_err(read_err)?;
        self.db
            .get(&rtxn, id)
            .map_err(read_err)?
            .map(|bytes| StateRecord::decode(id, bytes))
            .transpose()
    }

    fn clear(&self, id: &str) -> Result<()> {
        self.check_key(id)?;
        let clear_err = |e: heed::Error| TidemarkError::backend("clearing state", Some(id), e);
        let mut wtxn = self.env.write_txn().map_err(clear_err)?;
        let existed = self.db.delete(&mut wtxn, id).map_err(clear_err)?;
        wtxn.commit().map_err(clear_err)?;

        if existed {
            debug!(id = %id, "Cleared state");
        }
        Ok(())
    }

    fn list(&self, pattern: Option<&str>) -> Result<StateIds> {
        let pattern = IdPattern::new(pattern)?;
        let list_err = |e: heed::Error| TidemarkError::backend("listing state", None, e);
        let rtxn = self.env.read_txn().map_err(list_err)?;

        let mut candidates = Vec::new();
        if pattern.prefix().is_empty() {
            for entry in self.db.iter(&rtxn).map_err(list_err)? {
                let (id, _) = entry.map_err(list_err)?;
                candidates.push(id.to_string());
            }
        } else {
            for entry in self
                .db
                .prefix_iter(&rtxn, pattern.prefix())
                .map_err(list_err)?
            {
                let (id, _) = entry.map_err(list_err)?;
                candidates.push(id.to_string());
            }
        }

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
    use tempfile::TempDir;

    fn open(dir: &Path) -> LmdbStateStore {
        LmdbStateStore::open(dir, 8, &LockConfig::default()).unwrap()
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = open(temp.path());
            store
                .set(StateRecord::from_json("job", json!({"a": 1}), false).unwrap())
                .unwrap();
        }

        let store = open(temp.path());
        let record = store.get("job").unwrap().unwrap();
        assert_eq!(record.payload["a"], json!(1));
        assert!(!record.complete);
    }

    #[test]
    fn test_prefix_scan_respects_full_pattern() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        for id in ["job-a", "job-b", "jobless", "other"] {
            store
                .set(StateRecord::from_json(id, json!({}), true).unwrap())
                .unwrap();
        }

        let ids: Vec<_> = store.list(Some("job-?")).unwrap().collect();
        assert_eq!(ids, vec!["job-a", "job-b"]);
    }

    #[test]
    fn test_corrupt_value_is_isolated() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        store.put_raw("broken", b"\xff\xfe").unwrap();
        store
            .set(StateRecord::from_json("fine", json!({"a": 1}), true).unwrap())
            .unwrap();

        assert!(matches!(
            store.get("broken"),
            Err(TidemarkError::Serialization { .. })
        ));
        assert!(matches!(
            store.set(StateRecord::from_json("broken", json!({"a": 1}), false).unwrap()),
            Err(TidemarkError::Serialization { .. })
        ));
        assert!(store.get("fine").unwrap().is_some());

        // a complete write repairs the id without reading it
        store
            .set(StateRecord::from_json("broken", json!({"b": 2}), true).unwrap())
            .unwrap();
        assert_eq!(store.get("broken").unwrap().unwrap().payload["b"], json!(2));
    }

    #[test]
    fn test_oversized_map_fails_fast() {
        let temp = TempDir::new().unwrap();
        let conn = ConnectionString::parse(&format!(
            "lmdb://{}?map_size_mb={}",
            temp.path().display(),
            usize::MAX
        ))
        .unwrap();

        let err = LmdbStateStore::from_connection(&conn, &LockConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, TidemarkError::BackendConnection { .. }));
        assert!(err.to_string().contains("map size"));
    }

    #[test]
    fn test_key_size_limit() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        let max = store.env.max_key_size();

        let fits = "k".repeat(max);
        store
            .set(StateRecord::from_json(&fits, json!({"a": 1}), false).unwrap())
            .unwrap();
        assert!(store.get(&fits).unwrap().is_some());

        let too_long = "k".repeat(max + 1);
        for result in [
            store.set(StateRecord::from_json(&too_long, json!({}), true).unwrap()),
            store.clear(&too_long),
            store.get(&too_long).map(|_| ()),
        ] {
            assert!(matches!(result, Err(TidemarkError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_bad_location_fails_fast() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        let err = LmdbStateStore::open(&file, 8, &LockConfig::default()).err().unwrap();
        assert!(matches!(err, TidemarkError::BackendConnection { .. }));
    }
}
