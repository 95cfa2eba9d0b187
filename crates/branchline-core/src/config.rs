//! Core configuration loaded from `config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Default configuration constants
const DEFAULT_PERSIST_EVERY_EVENTS: usize = 10;
const DEFAULT_WARM_POOL_MAX_ENTRIES: usize = 10;
const DEFAULT_WARM_POOL_TTL_SECONDS: u64 = 300; // 5 minutes
const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_LOG_FILTER: &str = "info";
const MIN_PERSIST_EVERY_EVENTS: usize = 1;
const MIN_WARM_POOL_ENTRIES: usize = 1;
const MIN_SECONDS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON record per branch.
    #[default]
    Files,
    /// Single redb table of parent-linked rows.
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Write partial content back every N consumed events.
    pub persist_every_events: usize,
    pub append_stop_marker: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            persist_every_events: DEFAULT_PERSIST_EVERY_EVENTS,
            append_stop_marker: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub max_entries: usize,
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_WARM_POOL_MAX_ENTRIES,
            ttl_seconds: DEFAULT_WARM_POOL_TTL_SECONDS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
        }
    }
}

impl WarmPoolConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub backend: BackendKind,
    /// Overrides the resolved data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub streaming: StreamingConfig,
    pub warm_pool: WarmPoolConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: CoreConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Self::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.streaming.persist_every_events < MIN_PERSIST_EVERY_EVENTS {
            return Err(anyhow::anyhow!(
                "Persist interval must be at least {} event",
                MIN_PERSIST_EVERY_EVENTS
            ));
        }

        if self.warm_pool.max_entries < MIN_WARM_POOL_ENTRIES {
            return Err(anyhow::anyhow!(
                "Warm pool size must be at least {}",
                MIN_WARM_POOL_ENTRIES
            ));
        }

        if self.warm_pool.ttl_seconds < MIN_SECONDS {
            return Err(anyhow::anyhow!(
                "Warm pool TTL must be at least {} second",
                MIN_SECONDS
            ));
        }

        if self.warm_pool.cleanup_interval_seconds < MIN_SECONDS {
            return Err(anyhow::anyhow!(
                "Warm pool cleanup interval must be at least {} second",
                MIN_SECONDS
            ));
        }

        Ok(())
    }

    /// The configured data directory, else `BRANCHLINE_DIR` or `~/.branchline`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => branchline_storage::paths::resolve_branchline_dir(),
        }
    }
}
