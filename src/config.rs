//! Agent configuration.
//!
//! Sources, highest priority first: command-line flags, a JSON config file
//! (`--config` or the `QGA_CONFIG` environment variable), built-in defaults.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::agent::LoopTimings;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "QGA_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Character device to open. Auto-detected when unset.
    #[serde(default)]
    pub device: Option<PathBuf>,

    /// Serve on stdin/stdout instead of a device.
    #[serde(default)]
    pub stdio: bool,

    /// Commands that are never allowed to run.
    #[serde(default)]
    pub block_rpcs: Vec<String>,

    /// If non-empty, only these commands may run.
    #[serde(default)]
    pub allow_rpcs: Vec<String>,

    /// Bound on a single transport read.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Bound on writing one response to the device.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Wait before reopening a closed transport.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Wait after a transient read failure.
    #[serde(default = "default_transient_retry_ms")]
    pub transient_retry_ms: u64,
}

/// Values given on the command line. `None` leaves the loaded value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<PathBuf>,
    pub stdio: bool,
    pub block_rpcs: Option<Vec<String>>,
    pub allow_rpcs: Option<Vec<String>>,
}

const fn default_read_timeout_ms() -> u64 {
    1_000
}

const fn default_write_timeout_ms() -> u64 {
    10_000
}

const fn default_reconnect_delay_ms() -> u64 {
    5_000
}

const fn default_transient_retry_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            stdio: false,
            block_rpcs: Vec::new(),
            allow_rpcs: Vec::new(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            transient_retry_ms: default_transient_retry_ms(),
        }
    }
}

impl Config {
    /// Load from `explicit`, else from the file named by `QGA_CONFIG`, else
    /// defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match config_path(explicit, std::env::var_os(CONFIG_ENV_VAR)) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply command-line values on top of the loaded ones.
    pub fn apply(&mut self, overrides: Overrides) {
        if overrides.device.is_some() {
            self.device = overrides.device;
        }
        self.stdio |= overrides.stdio;
        if let Some(blocked) = overrides.block_rpcs {
            self.block_rpcs = blocked;
        }
        if let Some(allowed) = overrides.allow_rpcs {
            self.allow_rpcs = allowed;
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.read_timeout_ms > 0, "read_timeout_ms must be positive");
        ensure!(self.write_timeout_ms > 0, "write_timeout_ms must be positive");
        Ok(())
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub const fn loop_timings(&self) -> LoopTimings {
        LoopTimings {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            transient_retry: Duration::from_millis(self.transient_retry_ms),
        }
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        config.validate()?;
        Ok(config)
    }
}

/// Pick the config file: explicit flag first, then the environment value.
fn config_path(explicit: Option<&Path>, env_value: Option<OsString>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.filter(|v| !v.is_empty()).map(PathBuf::from))
}
