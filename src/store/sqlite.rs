//! SQLite-backed StateStore.
//!
//! One row per id in a state table:
//!
//! ```sql
//! state_id TEXT PRIMARY KEY, payload TEXT, complete INTEGER, updated_at_ms INTEGER
//! ```
//!
//! Partial writes take a lease in `<table>_locks` and then read-merge-write
//! inside an IMMEDIATE transaction, so writers in other processes sharing the
//! database file serialise on both the lease and SQLite's write lock.

use super::{BackendKind, ConnectionString, IdPattern, StateIds, StateStore};
use crate::lock::{LeaseLockManager, LockManager, StateLock};
use crate::models::{
    LockConfig, Payload, Result, StateRecord, TidemarkError, merge, validate_id,
};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default state table name.
pub const DEFAULT_TABLE: &str = "state";

const IN_MEMORY: &str = ":memory:";

/// Store with one row per id.
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    locks: LeaseLockManager,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// `:memory:` opens a private in-memory database.
    pub fn open(path: &Path, table: &str, config: &LockConfig) -> Result<Self> {
        validate_table_name(table)?;

        let conn = if path.as_os_str() == IN_MEMORY {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|e| TidemarkError::backend("open", None, e))?;
            }
            Connection::open(path)
        }
        .map_err(|e| TidemarkError::backend("open", None, e))?;

        conn.busy_timeout(config.timeout())
            .map_err(|e| TidemarkError::backend("open", None, e))?;
        let _journal: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| TidemarkError::backend("open", None, e))?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                state_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                complete INTEGER NOT NULL DEFAULT 0,
                updated_at_ms INTEGER NOT NULL
            )"
        ))
        .map_err(|e| TidemarkError::backend("creating state table", None, e))?;

        let conn = Arc::new(Mutex::new(conn));
        let locks = LeaseLockManager::new(Arc::clone(&conn), &format!("{table}_locks"), config)?;

        info!(path = %path.display(), table = %table, "Opened SQLite state store");
        Ok(Self {
            conn,
            table: table.to_string(),
            locks,
        })
    }

    pub fn from_connection(conn: &ConnectionString, config: &LockConfig) -> Result<Self> {
        let table = conn
            .option::<String>("table")?
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        Self::open(&conn.path(), &table, config)
    }

    /// Lease manager guarding this store's ids.
    pub fn lock_manager(&self) -> &LeaseLockManager {
        &self.locks
    }

    fn upsert(conn: &Connection, table: &str, record: &StateRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| TidemarkError::serialization(&record.id, e))?;

        conn.execute(
            &format!(
                "INSERT INTO {table} (state_id, payload, complete, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(state_id) DO UPDATE SET payload = excluded.payload,
                     complete = excluded.complete,
                     updated_at_ms = excluded.updated_at_ms"
            ),
            params![
                record.id,
                payload,
                record.complete,
                Utc::now().timestamp_millis()
            ],
        )
        .map_err(|e| TidemarkError::backend("writing state", Some(&record.id), e))?;
        Ok(())
    }

    fn select(conn: &Connection, table: &str, id: &str) -> Result<Option<StateRecord>> {
        let row: Option<(String, bool)> = conn
            .query_row(
                &format!("SELECT payload, complete FROM {table} WHERE state_id = ?1"),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| TidemarkError::backend("reading state", Some(id), e))?;

        row.map(|(payload, complete)| {
            let payload: Payload = serde_json::from_str(&payload)
                .map_err(|e| TidemarkError::serialization(id, e))?;
            Ok(StateRecord {
                id: id.to_string(),
                payload,
                complete,
            })
        })
        .transpose()
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TidemarkError::backend(
            "open",
            None,
            format!("invalid table name '{table}'"),
        ))
    }
}

impl StateStore for SqliteStateStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn set(&self, record: StateRecord) -> Result<()> {
        validate_id(&record.id)?;

        if record.complete {
            debug!(id = %record.id, "Writing complete state");
            return Self::upsert(&self.conn.lock(), &self.table, &record);
        }

        let id = record.id.clone();
        let _lock = self.locks.acquire(&id)?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| TidemarkError::backend("writing state", Some(&id), e))?;

        let existing = Self::select(&tx, &self.table, &id)?;
        let merged = merge(existing.as_ref(), record);
        Self::upsert(&tx, &self.table, &merged)?;

        tx.commit()
            .map_err(|e| TidemarkError::backend("writing state", Some(&id), e))?;

        debug!(id = %id, fields = merged.payload.len(), "Merged partial state");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        validate_id(id)?;
        Self::select(&self.conn.lock(), &self.table, id)
    }

    fn clear(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let deleted = self
            .conn
            .lock()
            .execute(
                &format!("DELETE FROM {} WHERE state_id = ?1", self.table),
                params![id],
            )
            .map_err(|e| TidemarkError::backend("clearing state", Some(id), e))?;

        if deleted > 0 {
            debug!(id = %id, "Cleared state");
        }
        Ok(())
    }

    fn list(&self, pattern: Option<&str>) -> Result<StateIds> {
        let pattern = IdPattern::new(pattern)?;
        let list_err = |e: rusqlite::Error| TidemarkError::backend("listing state", None, e);

        // The prefix never contains glob metacharacters, so it can be used
        // verbatim in a SQLite GLOB.
        let prefix_glob = format!("{}*", pattern.prefix());

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT state_id FROM {} WHERE state_id GLOB ?1 ORDER BY state_id",
                self.table
            ))
            .map_err(list_err)?;
        let candidates = stmt
            .query_map(params![prefix_glob], |row| row.get::<_, String>(0))
            .map_err(list_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(list_err)?;

        Ok(StateIds::new(candidates, pattern))
    }

    fn acquire_lock(&self, id: &str) -> Result<StateLock> {
        validate_id(id)?;
        self.locks.acquire(id)
    }
}
