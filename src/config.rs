//! Bridge configuration parsing and validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Delivery-queue tuning knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Default hold-back delay (milliseconds) applied to messages enqueued
    /// with `delay: true` but no explicit duration.
    #[serde(default = "default_hold_back_ms")]
    pub hold_back_ms: u64,
}

fn default_hold_back_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            hold_back_ms: default_hold_back_ms(),
        }
    }
}

/// Stdin wiring mode for the spawned agent process.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StdinMode {
    /// Pipe a writable stdin to the agent (interactive sessions).
    #[default]
    Piped,
    /// No stdin: one-shot prompt mode. `interrupt` is unavailable and
    /// turn cancellation falls back to a hard kill.
    Closed,
}

/// Configuration for spawning and driving one agent subprocess.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Agent CLI binary (e.g. `claude`).
    pub agent_cmd: String,
    /// Arguments passed to the agent binary.
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Working directory for the agent process.
    pub workspace_root: PathBuf,
    /// Stdin wiring mode.
    #[serde(default)]
    pub stdin_mode: StdinMode,
    /// Number of trailing stderr lines retained for exit-error messages.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
    /// Delivery-queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_stderr_tail_lines() -> usize {
    20
}

impl BridgeConfig {
    /// Parse a config from TOML text and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the TOML is malformed or a field
    /// fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when `agent_cmd` is empty or
    /// `stderr_tail_lines` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.agent_cmd.trim().is_empty() {
            return Err(AppError::Config("agent_cmd must not be empty".into()));
        }
        if self.stderr_tail_lines == 0 {
            return Err(AppError::Config(
                "stderr_tail_lines must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default hold-back delay as a [`Duration`].
    #[must_use]
    pub fn hold_back(&self) -> Duration {
        Duration::from_millis(self.queue.hold_back_ms)
    }
}
