//! Configuration loading
//!
//! Settings come from the first config file found, either
//! `~/.config/treeshare/config.toml` or `/etc/treeshare/config.toml`, then
//! from the environment variables `TREESHARE_MAX_BLOCK_PIPELINE` and
//! `TREESHARE_REQUEST_TIMEOUT` (seconds). Anything unset keeps its default.
//!
//! ```toml
//! max_block_pipeline = 32
//! request_timeout_secs = 20
//! max_slots = 64
//! storage_dir = "/var/lib/treeshare"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::constants::{DEFAULT_MAX_BLOCK_PIPELINE, MAX_SLOTS, REQUEST_TIMEOUT};
use crate::share::Share;
use crate::slot::SlotConfig;
use crate::storage::{BlobStore, DiskBlobStore, HashIndex, MemoryBlobStore, StorageError};

const ENV_MAX_BLOCK_PIPELINE: &str = "TREESHARE_MAX_BLOCK_PIPELINE";
const ENV_REQUEST_TIMEOUT: &str = "TREESHARE_REQUEST_TIMEOUT";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: {value:?}")]
    Env { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Block requests in flight per connection and direction.
    #[serde(default = "default_max_block_pipeline")]
    pub max_block_pipeline: usize,
    /// Seconds before an unanswered block request may be sent elsewhere.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Slots per connection and direction.
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    /// Directory for a [`DiskBlobStore`]; blobs are kept in memory when unset.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

fn default_max_block_pipeline() -> usize {
    DEFAULT_MAX_BLOCK_PIPELINE
}

fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT.as_secs()
}

fn default_max_slots() -> usize {
    MAX_SLOTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_pipeline: default_max_block_pipeline(),
            request_timeout_secs: default_request_timeout_secs(),
            max_slots: default_max_slots(),
            storage_dir: None,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the default locations and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_paths(), |name| std::env::var(name).ok())
    }

    /// Loads from the first existing file of `paths`, then applies overrides
    /// looked up through `env`.
    pub fn load_from(
        paths: &[PathBuf],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };

        if let Some(value) = env(ENV_MAX_BLOCK_PIPELINE) {
            config.max_block_pipeline = parse_env(ENV_MAX_BLOCK_PIPELINE, value)?;
        }
        if let Some(value) = env(ENV_REQUEST_TIMEOUT) {
            config.request_timeout_secs = parse_env(ENV_REQUEST_TIMEOUT, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Per-connection limits for a [`SlotManager`](crate::slot::SlotManager).
    pub fn slot_config(&self) -> SlotConfig {
        SlotConfig {
            max_block_pipeline: self.max_block_pipeline,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_slots: self.max_slots,
        }
    }

    /// Opens the blob store: on disk under `storage_dir` when set, in memory
    /// otherwise.
    pub fn blob_store(&self) -> Result<Arc<dyn BlobStore>, ConfigError> {
        match &self.storage_dir {
            Some(dir) => {
                debug!(dir = %dir.display(), "opening disk blob store");
                Ok(Arc::new(DiskBlobStore::open(dir)?))
            }
            None => Ok(Arc::new(MemoryBlobStore::new())),
        }
    }

    /// Builds an empty [`Share`] whose trees and payloads live in
    /// [`blob_store`](Self::blob_store).
    pub fn share(&self) -> Result<Share, ConfigError> {
        let store = self.blob_store()?;
        Ok(Share::new(Arc::new(HashIndex::new(Arc::clone(&store))), store))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&s)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_pipeline == 0 {
            return Err(ConfigError::Invalid(
                "max_block_pipeline must be at least 1".into(),
            ));
        }
        if self.max_slots == 0 || self.max_slots > MAX_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "max_slots must be between 1 and {}",
                MAX_SLOTS
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/treeshare/config.toml"));
    }
    paths.push(PathBuf::from("/etc/treeshare/config.toml"));
    paths
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { name, value })
}
