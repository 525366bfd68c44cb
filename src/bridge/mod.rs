//! Subprocess control-protocol bridge.
//!
//! Multiplexes three message kinds over the agent's NDJSON stdout stream
//! (control responses, role-reversed control requests, control cancels) and
//! forwards everything else as application messages to the relay stream.

pub mod codec;
pub mod control;
pub mod process;
pub mod wire;

pub use control::{AgentBridge, PermissionHandler};
pub use process::{ExitOutcome, ProcessHandle};
