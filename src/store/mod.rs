//! Run-state stores.
//!
//! Provides:
//! - `StateStore`: the backend-agnostic contract (set/get/clear/list/lock)
//! - `LmdbStateStore`: embedded LMDB key-value environment (reference backend)
//! - `SqliteStateStore`: one row per id in a SQLite table
//! - `FileStateStore`: one JSON object per id in a directory
//! - `MemoryStateStore`: process-local map for tests
//! - `open_store`: picks a backend from the connection-string scheme
//!
//! Every backend serialises partial writes to the same id through
//! `acquire_lock`, so concurrent checkpoints never lose fields. Writes to
//! different ids never contend.

mod file;
mod lmdb;
mod memory;
mod pattern;
mod sqlite;
mod uri;

pub use file::FileStateStore;
pub use lmdb::LmdbStateStore;
pub use memory::MemoryStateStore;
pub use pattern::IdPattern;
pub use sqlite::SqliteStateStore;
pub use uri::{BackendKind, ConnectionString};

use crate::lock::StateLock;
use crate::models::{Result, StateRecord, StoreConfig};
use tracing::{debug, info};

/// Storage contract shared by every backend.
///
/// Implementations are shared across threads; every method takes `&self`.
pub trait StateStore: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Store a record.
    ///
    /// Complete records overwrite unconditionally. Partial records are merged
    /// into the stored record while holding the id's lock.
    fn set(&self, record: StateRecord) -> Result<()>;

    /// Fetch the record for `id`, `None` if absent.
    fn get(&self, id: &str) -> Result<Option<StateRecord>>;

    /// Remove the record for `id`. Absent ids are not an error.
    fn clear(&self, id: &str) -> Result<()>;

    /// Ids matching an optional glob, from a point-in-time snapshot.
    fn list(&self, pattern: Option<&str>) -> Result<StateIds>;

    /// Lock `id` until the returned guard is dropped.
    fn acquire_lock(&self, id: &str) -> Result<StateLock>;

    /// Clear every id matching `pattern`; returns how many were cleared.
    fn clear_all(&self, pattern: Option<&str>) -> Result<usize> {
        let mut cleared = 0;
        for id in self.list(pattern)? {
            self.clear(&id)?;
            cleared += 1;
        }
        debug!(pattern = ?pattern, cleared, "Cleared matching state");
        Ok(cleared)
    }

    /// Replace `dst` with a complete copy of `src`.
    ///
    /// Returns `false` if `src` has no state.
    fn copy(&self, src: &str, dst: &str) -> Result<bool> {
        let Some(record) = self.get(src)? else {
            return Ok(false);
        };
        self.set(StateRecord::complete(dst, record.payload)?)?;
        Ok(true)
    }
}

/// Lazily filtered, restartable sequence of ids.
///
/// Backed by a snapshot of candidate keys taken when `list` was called;
/// the glob is applied as the sequence is consumed. Clone it to iterate again.
#[derive(Debug, Clone)]
pub struct StateIds {
    candidates: std::vec::IntoIter<String>,
    pattern: IdPattern,
}

impl StateIds {
    pub(crate) fn new(candidates: Vec<String>, pattern: IdPattern) -> Self {
        Self {
            candidates: candidates.into_iter(),
            pattern,
        }
    }
}

impl Iterator for StateIds {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let pattern = &self.pattern;
        self.candidates.find(|id| pattern.matches(id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.candidates.len()))
    }
}

/// Open the store selected by the configured connection string.
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn StateStore>> {
    let uri = config.resolve_uri();
    let conn = ConnectionString::parse(&uri)?;

    let store: Box<dyn StateStore> = match conn.kind {
        BackendKind::Lmdb => Box::new(LmdbStateStore::from_connection(&conn, &config.lock)?),
        BackendKind::Sqlite => Box::new(SqliteStateStore::from_connection(&conn, &config.lock)?),
        BackendKind::File => Box::new(FileStateStore::from_connection(&conn, &config.lock)?),
        BackendKind::Memory => Box::new(MemoryStateStore::new(&config.lock)),
    };

    info!(backend = %conn.kind, location = %conn.location, "{}", conn.kind.label());
    Ok(store)
}
