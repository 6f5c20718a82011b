//! Expiring lock rows in a SQLite database.
//!
//! A lock is a row `(state_id, holder, expires_at_ms)` in a locks table next
//! to the state table. A row whose lease has expired counts as unlocked and
//! is taken over by the next acquirer, so a crashed holder blocks others for
//! at most one lease TTL. Release deletes the row only if the holder token
//! still matches.

use super::{LockManager, StateLock, new_holder};
use crate::models::{LockConfig, Result, TidemarkError};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lease-based lock manager sharing a SQLite connection with its store.
#[derive(Clone)]
pub struct LeaseLockManager {
    conn: Arc<Mutex<Connection>>,
    table: String,
    timeout: Duration,
    poll_interval: Duration,
    ttl: Duration,
}

impl LeaseLockManager {
    /// Create the locks table (if needed) and the manager.
    pub fn new(conn: Arc<Mutex<Connection>>, table: &str, config: &LockConfig) -> Result<Self> {
        conn.lock()
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    state_id TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at_ms INTEGER NOT NULL
                )"
            ))
            .map_err(|e| TidemarkError::backend("creating lock table", None, e))?;

        Ok(Self {
            conn,
            table: table.to_string(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            ttl: config.lease_ttl(),
        })
    }

    /// Override the acquisition timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the lease lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Push the expiry of a held lease forward by one TTL.
    ///
    /// Returns `false` if the lease was lost (expired and taken over).
    pub fn renew(&self, lock: &StateLock) -> Result<bool> {
        let expires_at = now_ms() + self.ttl_ms();
        let changed = self
            .conn
            .lock()
            .execute(
                &format!(
                    "UPDATE {} SET expires_at_ms = ?3 WHERE state_id = ?1 AND holder = ?2",
                    self.table
                ),
                params![lock.id(), lock.holder(), expires_at],
            )
            .map_err(|e| TidemarkError::backend("renewing lease", Some(lock.id()), e))?;
        Ok(changed == 1)
    }

    /// Current holder of an unexpired lease, if any.
    pub fn holder(&self, id: &str) -> Result<Option<String>> {
        self.conn
            .lock()
            .query_row(
                &format!(
                    "SELECT holder FROM {} WHERE state_id = ?1 AND expires_at_ms > ?2",
                    self.table
                ),
                params![id, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TidemarkError::backend("reading lease", Some(id), e))
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX / 2)
    }

    /// One acquisition attempt. The connection mutex is held only for this call.
    fn try_acquire(&self, id: &str, holder: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| TidemarkError::backend("acquiring lease", Some(id), e))?;

        let now = now_ms();
        let existing: Option<(String, i64)> = tx
            .query_row(
                &format!(
                    "SELECT holder, expires_at_ms FROM {} WHERE state_id = ?1",
                    self.table
                ),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| TidemarkError::backend("acquiring lease", Some(id), e))?;

        match existing {
            Some((_, expires_at)) if expires_at > now => return Ok(false),
            Some((previous, expires_at)) => {
                warn!(
                    id = %id,
                    previous_holder = %previous,
                    expired_ms_ago = now - expires_at,
                    "Taking over expired lease"
                );
            }
            None => {}
        }

        tx.execute(
            &format!(
                "INSERT INTO {} (state_id, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(state_id) DO UPDATE SET holder = excluded.holder,
                     expires_at_ms = excluded.expires_at_ms",
                self.table
            ),
            params![id, holder, now + self.ttl_ms()],
        )
        .map_err(|e| TidemarkError::backend("acquiring lease", Some(id), e))?;

        tx.commit()
            .map_err(|e| TidemarkError::backend("acquiring lease", Some(id), e))?;
        Ok(true)
    }
}

impl LockManager for LeaseLockManager {
    fn acquire(&self, id: &str) -> Result<StateLock> {
        let token = new_holder();
        let started = Instant::now();

        while !self.try_acquire(id, &token)? {
            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!(id = %id, waited_ms = waited.as_millis() as u64, "Lease wait timed out");
                return Err(TidemarkError::LockTimeout {
                    id: id.to_string(),
                    waited,
                });
            }
            thread::sleep(self.poll_interval.min(self.timeout - waited));
        }

        debug!(id = %id, holder = %token, ttl_ms = self.ttl_ms(), "Lease acquired");
        Ok(StateLock::new(
            id,
            token.clone(),
            LeaseRelease {
                conn: Arc::clone(&self.conn),
                table: self.table.clone(),
                id: id.to_string(),
                holder: token,
            },
        ))
    }
}

struct LeaseRelease {
    conn: Arc<Mutex<Connection>>,
    table: String,
    id: String,
    holder: String,
}

impl Drop for LeaseRelease {
    fn drop(&mut self) {
        let result = self.conn.lock().execute(
            &format!(
                "DELETE FROM {} WHERE state_id = ?1 AND holder = ?2",
                self.table
            ),
            params![self.id, self.holder],
        );
        match result {
            Ok(0) => warn!(id = %self.id, "Lease expired before release"),
            Ok(_) => debug!(id = %self.id, "Lease released"),
            Err(e) => warn!(id = %self.id, error = %e, "Failed to release lease; it will expire"),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
