//! Configuration models for tidemark.
//!
//! The project file is loaded once at startup and passed by reference to
//! everything that needs it. There is no process-wide override state: an
//! override is just another field on [`Config`].

use crate::schedule::Schedule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default project file name.
pub const DEFAULT_CONFIG_FILE: &str = "tidemark.toml";

/// Top-level configuration for tidemark.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where run state is stored and how it is locked
    #[serde(default)]
    pub state_backend: StoreConfig,

    /// Registered schedules, keyed by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<Schedule>,
}

/// State backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string; the scheme selects the backend
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Environment variable that overrides `uri` when set
    #[serde(default = "default_uri_env", skip_serializing_if = "Option::is_none")]
    pub uri_env: Option<String>,

    /// Lock behaviour shared by all backends
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_uri() -> String {
    "lmdb://.tidemark/state".to_string()
}

fn default_uri_env() -> Option<String> {
    Some("TIDEMARK_STATE_BACKEND_URI".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            uri_env: default_uri_env(),
            lock: LockConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Build a config for an explicit connection string, ignoring the environment.
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            uri_env: None,
            lock: LockConfig::default(),
        }
    }

    /// Resolve the effective connection string.
    ///
    /// The override variable wins over `uri`; `${VAR}` placeholders are expanded.
    pub fn resolve_uri(&self) -> String {
        let raw = self
            .uri_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.uri.clone());
        expand_env_vars(&raw)
    }
}

/// Per-id lock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Maximum time to wait for a lock before `LockTimeout`
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,

    /// Polling interval for locks without a wakeup primitive (files, leases)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease lifetime for backends that lock with expiring rows
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

fn default_lock_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    25
}

fn default_lease_ttl() -> u64 {
    60
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
            poll_interval_ms: default_poll_interval(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load configuration, falling back to defaults if the file does not exist.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write configuration to a TOML file (atomic write).
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        let temp_path = temp_path_for(path);
        fs::write(&temp_path, content).map_err(|e| ConfigError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        fs::rename(&temp_path, path).map_err(|e| ConfigError::FileWrite {
            path: path.to_owned(),
            source: e,
        })
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
    name.push(".tmp");
    path.with_file_name(name)
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
