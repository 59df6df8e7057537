//! Engine configuration.

use crate::error::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Overrides `max_workers`.
pub const MAX_WORKERS_ENV: &str = "CONVENIENT_MAX_WORKERS";
/// Overrides `fail_fast`.
pub const FAIL_FAST_ENV: &str = "CONVENIENT_FAIL_FAST";

/// Settings for one build process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Nodes executed in parallel.
    pub max_workers: usize,
    /// Stop starting nodes after the first failure.
    pub fail_fast: bool,
    /// How long to wait for a cross-process lock.
    pub lock_timeout_ms: u64,
    /// Listen for and send contention pings.
    pub contention_ping: bool,
    /// Store and load outputs through the local build cache.
    pub build_cache_enabled: bool,
    /// Invalidate the file system cache from OS notifications.
    pub watch_file_system: bool,
    /// Names skipped by every directory walk.
    pub default_excludes: Vec<String>,
    /// Directory for execution history and the build cache.
    pub cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            fail_fast: false,
            lock_timeout_ms: 60_000,
            contention_ping: true,
            build_cache_enabled: true,
            watch_file_system: false,
            default_excludes: convenient_vfs::DEFAULT_EXCLUDES
                .iter()
                .map(|pattern| (*pattern).to_string())
                .collect(),
            cache_dir: PathBuf::from(".convenient"),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or an override is not a
    /// valid value.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded engine configuration");
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Fails if an override is not a valid value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Config` for a value that does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(MAX_WORKERS_ENV) {
            self.max_workers = value.trim().parse().map_err(|_| {
                ExecutionError::Config(format!("{MAX_WORKERS_ENV} must be a positive number, got '{value}'"))
            })?;
        }
        if let Some(value) = lookup(FAIL_FAST_ENV) {
            self.fail_fast = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ExecutionError::Config(format!(
                        "{FAIL_FAST_ENV} must be true or false, got '{value}'"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Config` for zero workers.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ExecutionError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock timeout as a duration.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
