//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering all failure modes of the bridge.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// A line from the agent could not be parsed (recovered locally,
    /// never surfaced to the consumer).
    Parse(String),
    /// A control response carried `subtype: "error"`; delivered only to
    /// the caller awaiting that request id.
    Control(String),
    /// The agent process exited abnormally, failed to spawn, or closed
    /// its streams unexpectedly.
    Process(String),
    /// External cancellation; takes precedence over a simultaneous exit
    /// error.
    Aborted(String),
    /// API misuse such as iterating the relay stream twice or calling
    /// `interrupt` without a writable input. Fail fast, never retried.
    Usage(String),
    /// Underlying I/O failure on the agent's stdio.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Parse(msg) => write!(f, "parse: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Aborted(msg) => write!(f, "aborted: {msg}"),
            Self::Usage(msg) => write!(f, "usage: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl AppError {
    /// Whether this error is abort-flavored.
    ///
    /// Exit-path classification uses this to let an external abort win
    /// over exit-code interpretation.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}
