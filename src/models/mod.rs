//! Core data models for tidemark.
//!
//! - `record`: the persisted run-state unit and its merge rule
//! - `config`: the project file, loaded once and passed by reference
//! - `error`: the crate-wide error taxonomy
//! - `key`: filesystem-safe encoding of ids

mod config;
mod error;
mod key;
mod record;

pub use config::*;
pub use error::*;
pub use key::*;
pub use record::*;
