//! tidemark - Run-state store for resumable recurring data-integration pipelines.
//!
//! ## Architecture
//!
//! A pipeline run reads its prior state, periodically writes partial
//! checkpoints, and writes a complete snapshot on success. tidemark persists
//! those records behind one [`StateStore`] trait:
//! - **Records**: `{id, payload, complete}`; partial records merge, complete ones replace
//! - **Backends**: LMDB (reference), SQLite, directory of JSON objects, memory
//! - **Locks**: per-id mutual exclusion with bounded waits, so concurrent
//!   partial writers never lose fields
//!
//! ## Configuration
//!
//! A TOML project file selects the backend with a connection string
//! (`lmdb://`, `sqlite://`, `file://`, `memory://`) and registers schedules,
//! whose names are the ids their state is stored under.

pub mod lock;
pub mod models;
pub mod schedule;
pub mod store;

// Re-exports for convenience
pub use lock::{LockManager, StateLock};
pub use models::{Config, Payload, Result, StateRecord, StoreConfig, TidemarkError};
pub use schedule::{Schedule, ScheduleService};
pub use store::{StateIds, StateStore, open_store};
