#![forbid(unsafe_code)]
//! Bridge between a local coding-agent subprocess and a remote session-sync
//! service.
//!
//! The crate translates the agent's raw stdio into ordered, interruptible
//! message delivery and back:
//!
//! - [`bridge`] — subprocess control-protocol bridge: NDJSON framing,
//!   request/response correlation by id, permission callbacks, cancellation.
//! - [`relay`] — single-consumer push/pull adapter between the line reader
//!   and the application-level consumer.
//! - [`queue`] — ordered, delay/release-gated outgoing delivery queue.
//! - [`cancel`] — per-turn cancellation scope tying interrupt, kill, and
//!   queued-item release together.
//!
//! Transport to the remote side (HTTP/WebSocket), authentication, settings
//! persistence, and agent message-schema translation are external
//! collaborators and out of scope here.

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod queue;
pub mod relay;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
