//! Runtime configuration.
//!
//! Layers, later ones winning: built-in defaults, an optional TOML file,
//! `LIVEPAGE_*` environment variables, then command-line flags (applied by
//! the binary).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memo::MemoOptions;

pub const DEFAULT_CONFIG_FILE: &str = "livepage.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown log format `{0}`, expected compact, pretty or json")]
    LogFormat(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::LogFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runs after which a session no longer counts as holding a cached message.
    pub message_cache_max_age: u64,
    /// Deltas smaller than this are always sent in full.
    pub min_cached_message_size: usize,
    /// Deltas larger than this are replaced by an error element.
    pub max_message_size: usize,
    pub delivery_interval_ms: u64,
    pub memo_default_ttl_secs: Option<u64>,
    pub memo_default_max_entries: Option<usize>,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            message_cache_max_age: 2,
            min_cached_message_size: 10 * 1024,
            max_message_size: 200 * 1024 * 1024,
            delivery_interval_ms: 10,
            memo_default_ttl_secs: None,
            memo_default_max_entries: None,
            log_format: LogFormat::Compact,
        }
    }
}

impl RuntimeConfig {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms.max(1))
    }

    pub fn memo_defaults(&self) -> MemoOptions {
        MemoOptions {
            ttl: self.memo_default_ttl_secs.map(Duration::from_secs),
            max_entries: self.memo_default_max_entries,
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path`, or `./livepage.toml` if it exists, then applies the
    /// environment. An explicit path that cannot be read is an error; a
    /// missing default file is not.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_toml_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `LIVEPAGE_*` overrides read through `lookup`. Invalid values
    /// are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(raw) = read("LIVEPAGE_MESSAGE_CACHE_MAX_AGE") {
            override_parsed(&mut self.message_cache_max_age, "LIVEPAGE_MESSAGE_CACHE_MAX_AGE", &raw);
        }
        if let Some(raw) = read("LIVEPAGE_MIN_CACHED_MESSAGE_SIZE") {
            override_parsed(&mut self.min_cached_message_size, "LIVEPAGE_MIN_CACHED_MESSAGE_SIZE", &raw);
        }
        if let Some(raw) = read("LIVEPAGE_MAX_MESSAGE_SIZE") {
            override_parsed(&mut self.max_message_size, "LIVEPAGE_MAX_MESSAGE_SIZE", &raw);
        }
        if let Some(raw) = read("LIVEPAGE_DELIVERY_INTERVAL_MS") {
            override_parsed(&mut self.delivery_interval_ms, "LIVEPAGE_DELIVERY_INTERVAL_MS", &raw);
        }
        if let Some(raw) = read("LIVEPAGE_MEMO_DEFAULT_TTL_SECS") {
            match raw.parse::<u64>() {
                Ok(value) => self.memo_default_ttl_secs = Some(value),
                Err(err) => tracing::warn!("invalid LIVEPAGE_MEMO_DEFAULT_TTL_SECS, ignoring: {err}"),
            }
        }
        if let Some(raw) = read("LIVEPAGE_MEMO_DEFAULT_MAX_ENTRIES") {
            match raw.parse::<usize>() {
                Ok(value) => self.memo_default_max_entries = Some(value),
                Err(err) => tracing::warn!("invalid LIVEPAGE_MEMO_DEFAULT_MAX_ENTRIES, ignoring: {err}"),
            }
        }
        if let Some(raw) = read("LIVEPAGE_LOG_FORMAT") {
            override_parsed(&mut self.log_format, "LIVEPAGE_LOG_FORMAT", &raw);
        }
    }
}

fn override_parsed<T>(field: &mut T, key: &str, raw: &str)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw.parse::<T>() {
        Ok(value) => *field = value,
        Err(err) => tracing::warn!("invalid {key}, ignoring: {err}"),
    }
}
