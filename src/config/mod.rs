//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - Environment variables
//! - CLI arguments
//!
//! Also provides the [`SettingsStore`] facade consumed by the slave and
//! session pipeline: a flat `get(key) -> (value, ok)` view over the loaded
//! configuration, so callers that only care about a handful of keys (timed
//! login, auto login) never take a dependency on the whole config tree.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod types;

pub use types::{
    AutoLoginConfig, DaemonConfig, GreeterConfig, LoggingConfig, SeatConfig, TimedLoginConfig,
    XServerConfig,
};

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A required setting is absent and has no documented default
    #[error("required setting missing: {0}")]
    Missing(&'static str),

    /// A setting holds a value outside its accepted range
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon identity and directories
    pub daemon: DaemonConfig,
    /// X server launch settings
    pub xserver: XServerConfig,
    /// Greeter UI settings
    pub greeter: GreeterConfig,
    /// Automatic login
    pub auto_login: AutoLoginConfig,
    /// Timed login
    pub timed_login: TimedLoginConfig,
    /// Seat and device resolution
    pub seat: SeatConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.daemon.user.is_empty() {
            return Err(ConfigError::Missing("daemon.user"));
        }
        if self.daemon.group.is_empty() {
            return Err(ConfigError::Missing("daemon.group"));
        }
        if self.xserver.command.as_os_str().is_empty() {
            return Err(ConfigError::Missing("xserver.command"));
        }
        if self.xserver.first_vt == 0 {
            return Err(ConfigError::Invalid {
                key: "xserver.first_vt",
                reason: "virtual terminals are numbered from 1".to_string(),
            });
        }
        if self.xserver.ready_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "xserver.ready_timeout_secs",
                reason: "timeout must be positive".to_string(),
            });
        }
        match self.logging.format.as_str() {
            "json" | "pretty" | "compact" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "logging.format",
                    reason: format!("unknown format '{other}'"),
                })
            }
        }
        Ok(())
    }

    /// Apply CLI overrides on top of the loaded file
    pub fn with_overrides(mut self, seat: Option<String>, log_file: Option<PathBuf>) -> Self {
        if let Some(seat) = seat {
            self.seat.default_seat = seat;
        }
        if log_file.is_some() {
            self.logging.file = log_file;
        }
        self
    }

    /// Flat settings view over this configuration
    pub fn settings(&self) -> TomlSettings {
        TomlSettings::from_config(self)
    }
}

/// Flat `get(key) -> (value, ok)` settings facade
///
/// Lookups never error: an unset or mistyped key yields the type's default
/// plus `ok = false`, which callers treat as "use the documented default".
pub trait SettingsStore: Send + Sync {
    fn get_bool(&self, key: &str) -> (bool, bool);
    fn get_int(&self, key: &str) -> (i64, bool);
    fn get_string(&self, key: &str) -> (String, bool);
}

/// [`SettingsStore`] backed by a TOML document
///
/// Keys are dotted paths into the document (`"timed_login.delay"`).
#[derive(Debug, Clone)]
pub struct TomlSettings {
    root: toml::Value,
}

impl TomlSettings {
    pub fn new(root: toml::Value) -> Self {
        Self { root }
    }

    fn from_config(config: &Config) -> Self {
        // Round-trip through toml::Value; Config is fully serializable.
        let root = toml::Value::try_from(config)
            .unwrap_or_else(|_| toml::Value::Table(toml::value::Table::new()));
        Self { root }
    }

    fn lookup(&self, key: &str) -> Option<&toml::Value> {
        let mut node = &self.root;
        for part in key.split('.') {
            node = node.as_table()?.get(part)?;
        }
        Some(node)
    }
}

impl SettingsStore for TomlSettings {
    fn get_bool(&self, key: &str) -> (bool, bool) {
        match self.lookup(key).and_then(toml::Value::as_bool) {
            Some(v) => (v, true),
            None => (false, false),
        }
    }

    fn get_int(&self, key: &str) -> (i64, bool) {
        match self.lookup(key).and_then(toml::Value::as_integer) {
            Some(v) => (v, true),
            None => (0, false),
        }
    }

    fn get_string(&self, key: &str) -> (String, bool) {
        match self.lookup(key).and_then(toml::Value::as_str) {
            Some(v) => (v.to_string(), true),
            None => (String::new(), false),
        }
    }
}
