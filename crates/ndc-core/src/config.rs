//! Runtime configuration, read from a TOML file.
//!
//! Every field has a default; a missing file yields the defaults.
//!
//! ```toml
//! [replication]
//! rebuild_page_size = 100
//! max_event_batch_size = 100
//!
//! [cache]
//! lock_timeout_ms = 5000
//! max_executions = 1024
//!
//! [store]
//! sqlite_busy_timeout_ms = 5000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// History nodes read per page while rebuilding.
    #[serde(default = "default_rebuild_page_size")]
    pub rebuild_page_size: usize,
    /// Largest batch a local write may append at once.
    #[serde(default = "default_max_event_batch_size")]
    pub max_event_batch_size: usize,
    /// Abort rebuilds after this long. Unset means no deadline.
    #[serde(default)]
    pub rebuild_timeout_ms: Option<u64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            rebuild_page_size: default_rebuild_page_size(),
            max_event_batch_size: default_max_event_batch_size(),
            rebuild_timeout_ms: None,
        }
    }
}

impl ReplicationConfig {
    #[must_use]
    pub fn rebuild_timeout(&self) -> Option<Duration> {
        self.rebuild_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_max_executions")]
    pub max_executions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            max_executions: default_max_executions(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_sqlite_busy_timeout_ms")]
    pub sqlite_busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_busy_timeout_ms: default_sqlite_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn sqlite_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_busy_timeout_ms)
    }
}

/// Load the config at `path`, falling back to defaults if it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
}

/// Parse a TOML config document.
///
/// # Errors
///
/// Returns an error on invalid TOML or mistyped fields.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    Ok(config)
}

const fn default_rebuild_page_size() -> usize {
    100
}

const fn default_max_event_batch_size() -> usize {
    100
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_max_executions() -> usize {
    1_024
}

const fn default_sqlite_busy_timeout_ms() -> u64 {
    5_000
}
