//! Error types for tidemark.
//!
//! Taxonomy:
//! - Backend faults: the store could not be opened or an I/O call failed
//! - Data faults: stored bytes for one id cannot be decoded
//! - Contention: a per-id lock was not obtained in time (retryable)
//! - Caller faults: malformed input rejected before touching the backend

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for tidemark.
#[derive(Debug, Error)]
pub enum TidemarkError {
    // ═══════════════════════════════════════════════════════════════════
    // BACKEND: storage unreachable or failing
    // ═══════════════════════════════════════════════════════════════════

    #[error("Backend error during {operation}{}: {message}", fmt_id(.id))]
    BackendConnection {
        operation: String,
        id: Option<String>,
        message: String,
    },

    #[error("Serialization error for state '{id}': {message}")]
    Serialization { id: String, message: String },

    // ═══════════════════════════════════════════════════════════════════
    // CONTENTION: retryable by the caller
    // ═══════════════════════════════════════════════════════════════════

    #[error("Timed out after {waited:?} waiting for lock on state '{id}'")]
    LockTimeout { id: String, waited: Duration },

    // ═══════════════════════════════════════════════════════════════════
    // CALLER: rejected input and domain conflicts
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Schedule '{0}' already exists")]
    ScheduleAlreadyExists(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL: invariant broken
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_id(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(" of state '{id}'"),
        None => String::new(),
    }
}

impl TidemarkError {
    /// Create a backend error with operation and optional id context.
    pub fn backend(
        operation: impl Into<String>,
        id: Option<&str>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::BackendConnection {
            operation: operation.into(),
            id: id.map(str::to_string),
            message: err.to_string(),
        }
    }

    /// Create a serialization error for a single id.
    pub fn serialization(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            id: id.into(),
            message: err.to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Result type alias for tidemark.
pub type Result<T> = std::result::Result<T, TidemarkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backend_error_display_with_id() {
        let err = TidemarkError::backend("get", Some("job-a"), "disk on fire");
        assert_eq!(
            err.to_string(),
            "Backend error during get of state 'job-a': disk on fire"
        );
    }

    #[test]
    fn test_backend_error_display_without_id() {
        let err = TidemarkError::backend("open", None, "no such directory");
        assert_eq!(err.to_string(), "Backend error during open: no such directory");
    }

    #[test]
    fn test_only_lock_timeout_is_retryable() {
        let timeout = TidemarkError::LockTimeout {
            id: "job-a".to_string(),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(!TidemarkError::serialization("job-a", "bad").is_retryable());
        assert!(!TidemarkError::InvalidInput("empty id".to_string()).is_retryable());
    }
}
