//! Connection strings.
//!
//! `scheme://location[?key=value&...]`. The scheme picks the backend, the
//! location is backend-specific (a directory, a database file), and options
//! tune the backend.

use crate::models::{Result, TidemarkError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Storage backend selected by a connection-string scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Embedded LMDB key-value environment
    Lmdb,
    /// SQLite table
    Sqlite,
    /// Directory of JSON objects
    File,
    /// Process-local map
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lmdb => "lmdb",
            Self::Sqlite => "sqlite",
            Self::File => "file",
            Self::Memory => "memory",
        }
    }

    /// Human-readable description.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Lmdb => "On-disk LMDB key-value store",
            Self::Sqlite => "SQLite state table",
            Self::File => "Local directory object store",
            Self::Memory => "In-process memory store",
        }
    }
}

impl FromStr for BackendKind {
    type Err = TidemarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lmdb" => Ok(Self::Lmdb),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "file" => Ok(Self::File),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(TidemarkError::backend(
                "open",
                None,
                format!("unsupported state backend scheme '{other}'"),
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub kind: BackendKind,
    pub location: String,
    pub options: BTreeMap<String, String>,
}

impl ConnectionString {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
            TidemarkError::backend(
                "open",
                None,
                format!("connection string '{uri}' has no scheme (expected scheme://location)"),
            )
        })?;
        let kind: BackendKind = scheme.parse()?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut options = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            options.insert(key.to_string(), value.to_string());
        }

        if kind != BackendKind::Memory && location.is_empty() {
            return Err(TidemarkError::backend(
                "open",
                None,
                format!("{kind} connection string requires a location"),
            ));
        }

        Ok(Self {
            kind,
            location: location.to_string(),
            options,
        })
    }

    /// Location as a filesystem path.
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.location)
    }

    /// Parse an option value, `None` if absent.
    pub fn option<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        self.options
            .get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    TidemarkError::backend(
                        "open",
                        None,
                        format!("invalid value '{raw}' for option '{key}': {e}"),
                    )
                })
            })
            .transpose()
    }
}

impl FromStr for ConnectionString {
    type Err = TidemarkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_absolute_path() {
        let parsed = ConnectionString::parse("lmdb:///var/lib/tidemark/state").unwrap();
        assert_eq!(parsed.kind, BackendKind::Lmdb);
        assert_eq!(parsed.path(), PathBuf::from("/var/lib/tidemark/state"));
        assert!(parsed.options.is_empty());
    }

    #[test]
    fn test_relative_path_and_options() {
        let parsed = ConnectionString::parse("sqlite://.tidemark/state.db?table=runs").unwrap();
        assert_eq!(parsed.kind, BackendKind::Sqlite);
        assert_eq!(parsed.location, ".tidemark/state.db");
        assert_eq!(parsed.option::<String>("table").unwrap().as_deref(), Some("runs"));
        assert_eq!(parsed.option::<u64>("missing").unwrap(), None);
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let parsed: ConnectionString = "LMDB:///tmp/x".parse().unwrap();
        assert_eq!(parsed.kind, BackendKind::Lmdb);
    }

    #[test]
    fn test_memory_needs_no_location() {
        let parsed = ConnectionString::parse("memory://").unwrap();
        assert_eq!(parsed.kind, BackendKind::Memory);
    }

    #[test]
    fn test_unknown_scheme_fails_fast() {
        let err = ConnectionString::parse("s3://bucket/prefix").unwrap_err();
        assert!(err.to_string().contains("unsupported state backend scheme 's3'"));
    }

    #[test]
    fn test_missing_scheme_and_location() {
        assert!(ConnectionString::parse("/var/lib/state").is_err());
        assert!(ConnectionString::parse("file://").is_err());
    }

    #[test]
    fn test_bad_option_value() {
        let parsed = ConnectionString::parse("lmdb:///tmp/x?map_size_mb=lots").unwrap();
        assert!(parsed.option::<usize>("map_size_mb").is_err());
    }
}
