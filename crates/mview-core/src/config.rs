use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::UpdateError;
use crate::memory::{DEFAULT_THRESHOLD_PERCENT, MemoryGuard, parse_memory_limit};

/// Environment variable that replaces `memory.limit`.
pub const MEMORY_LIMIT_ENV: &str = "MVIEW_MEMORY_LIMIT";

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MviewConfig {
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Ids per action call when a view has no override.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    /// Versions read from the changelog per checkpointed sub-range.
    #[serde(default = "default_version_batch_size")]
    pub version_batch_size: u64,
    /// Per-view chunk size overrides.
    #[serde(default)]
    pub chunk_sizes: BTreeMap<String, usize>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            version_batch_size: default_version_batch_size(),
            chunk_sizes: BTreeMap::new(),
        }
    }
}

impl UpdateConfig {
    /// Chunk size for `view_id`: its override if any, else the default.
    #[must_use]
    pub fn chunk_size_for(&self, view_id: &str) -> usize {
        self.chunk_sizes
            .get(view_id)
            .copied()
            .unwrap_or(self.default_chunk_size)
    }
}

/// A memory limit as written in TOML: bytes, or a string like `"512M"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(i64),
    Text(String),
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::Bytes(0)
    }
}

impl MemoryLimit {
    /// Limit in bytes; 0 means the guard is off.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => u64::try_from(*bytes).unwrap_or(0),
            Self::Text(text) => parse_memory_limit(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub limit: MemoryLimit,
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit: MemoryLimit::default(),
            threshold_percent: default_threshold_percent(),
        }
    }
}

impl MemoryConfig {
    /// Build the guard described by this section.
    #[must_use]
    pub fn guard(&self) -> MemoryGuard {
        MemoryGuard::new(self.limit.bytes(), self.threshold_percent)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log a backtrace of the caller whenever a pass starts.
    #[serde(default)]
    pub trace_passes: bool,
}

impl MviewConfig {
    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] naming the first bad setting.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.update.default_chunk_size == 0 {
            return Err(UpdateError::Config(
                "update.default_chunk_size must be positive".into(),
            ));
        }
        if self.update.version_batch_size == 0 {
            return Err(UpdateError::Config(
                "update.version_batch_size must be positive".into(),
            ));
        }
        if let Some((view, _)) = self.update.chunk_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(UpdateError::Config(format!(
                "update.chunk_sizes.{view} must be positive"
            )));
        }
        if !(1..=100).contains(&self.memory.threshold_percent) {
            return Err(UpdateError::Config(format!(
                "memory.threshold_percent must be within 1..=100, got {}",
                self.memory.threshold_percent
            )));
        }
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self, memory_limit: Option<String>) {
        if let Some(limit) = memory_limit.filter(|value| !value.trim().is_empty()) {
            self.memory.limit = MemoryLimit::Text(limit);
        }
    }
}

/// Load `path`, falling back to defaults when the file does not exist, then
/// apply `MVIEW_MEMORY_LIMIT` and validate.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or fails
/// validation.
pub fn load_config(path: &Path) -> Result<MviewConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<MviewConfig>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        MviewConfig::default()
    };

    config.apply_env_overrides(std::env::var(MEMORY_LIMIT_ENV).ok());
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

const fn default_chunk_size() -> usize {
    1000
}

const fn default_version_batch_size() -> u64 {
    100_000
}

const fn default_threshold_percent() -> u8 {
    DEFAULT_THRESHOLD_PERCENT
}
