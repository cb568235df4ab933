//! Execution configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};

/// Prefix for environment overrides, e.g. `CORRAL_SHIM_PATH`
pub const ENV_PREFIX: &str = "CORRAL";

/// Paths and timings used when launching and supervising processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Shim executable
    pub shim_path: PathBuf,
    /// Low-level runtime passed to the shim
    pub runtime_path: PathBuf,
    /// Exit-code poll period for the polling backend (worst-case `wait` latency)
    pub exit_poll_interval_ms: u64,
    /// How long to keep retrying a named pipe that is not there yet
    pub pipe_open_timeout_ms: u64,
    /// Initial retry backoff when opening named pipes
    pub pipe_open_backoff_ms: u64,
    /// Grace period for the runtime log drain and output relays after exit
    pub drain_grace_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shim_path: PathBuf::from("corral-shim"),
            runtime_path: PathBuf::from("runc"),
            exit_poll_interval_ms: 100,
            pipe_open_timeout_ms: 5_000,
            pipe_open_backoff_ms: 20,
            drain_grace_ms: 1_000,
        }
    }
}

impl ExecConfig {
    /// Create configuration with default timings
    pub fn new(shim_path: impl Into<PathBuf>, runtime_path: impl Into<PathBuf>) -> Self {
        Self {
            shim_path: shim_path.into(),
            runtime_path: runtime_path.into(),
            ..Self::default()
        }
    }

    /// Load configuration from an optional TOML file layered under
    /// `CORRAL_`-prefixed environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let built = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let config: ExecConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make supervision spin or never retry
    pub fn validate(&self) -> Result<()> {
        if self.shim_path.as_os_str().is_empty() {
            return Err(ExecError::Config("shim_path must not be empty".to_string()));
        }
        if self.runtime_path.as_os_str().is_empty() {
            return Err(ExecError::Config(
                "runtime_path must not be empty".to_string(),
            ));
        }
        if self.exit_poll_interval_ms == 0 {
            return Err(ExecError::Config(
                "exit_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.pipe_open_backoff_ms == 0 {
            return Err(ExecError::Config(
                "pipe_open_backoff_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Set shim path
    pub fn with_shim_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shim_path = path.into();
        self
    }

    /// Set runtime path
    pub fn with_runtime_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_path = path.into();
        self
    }

    /// Set exit-code poll interval
    pub fn with_exit_poll_interval(mut self, interval: Duration) -> Self {
        self.exit_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set named pipe open timeout
    pub fn with_pipe_open_timeout(mut self, timeout: Duration) -> Self {
        self.pipe_open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set drain grace period
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn pipe_open_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_open_timeout_ms)
    }

    pub fn pipe_open_backoff(&self) -> Duration {
        Duration::from_millis(self.pipe_open_backoff_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}
