//! Shared fixtures for bridge integration tests.
//!
//! [`duplex_bridge`] wires an [`AgentBridge`] over in-memory duplex pipes
//! so tests can play the agent's side of the wire without a real process:
//! write NDJSON lines into `agent_stdout`, read the bridge's writes from
//! `agent_stdin`, and publish the exit outcome through `exit_tx`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use agent_relay::bridge::{AgentBridge, ExitOutcome, PermissionHandler, ProcessHandle};
use agent_relay::Result;

/// Install the env-filtered tracing subscriber, once per test binary.
/// Run with `RUST_LOG=debug` to see bridge internals on failure.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

/// Permission handler that allows every tool call.
pub struct AllowAll;

impl PermissionHandler for AllowAll {
    fn can_use_tool(
        &self,
        _tool_name: String,
        input: Value,
        _cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
        Box::pin(async move { Ok(json!({ "behavior": "allow", "updatedInput": input })) })
    }
}

/// Permission handler that blocks until cancelled, then reports the
/// cancellation as an error.
pub struct BlockUntilCancelled;

impl PermissionHandler for BlockUntilCancelled {
    fn can_use_tool(
        &self,
        _tool_name: String,
        _input: Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
        Box::pin(async move {
            cancel.cancelled().await;
            Err(agent_relay::AppError::Aborted("permission check cancelled".into()))
        })
    }
}

/// In-memory harness around one [`AgentBridge`].
pub struct BridgeHarness {
    pub bridge: Arc<AgentBridge>,
    /// Write NDJSON here to emit agent stdout lines.
    pub agent_stdout: DuplexStream,
    /// Lines the bridge wrote to the agent's stdin.
    pub agent_stdin: tokio::io::Lines<BufReader<DuplexStream>>,
    /// Publish the process exit outcome (single fire).
    pub exit_tx: watch::Sender<Option<ExitOutcome>>,
    /// Kill token given to the process handle.
    pub kill: CancellationToken,
    /// External abort signal.
    pub abort: CancellationToken,
}

/// Build a bridge over duplex pipes, with or without a writable stdin.
pub fn duplex_bridge(handler: Arc<dyn PermissionHandler>, with_stdin: bool) -> BridgeHarness {
    use tokio::io::AsyncBufReadExt;

    init_tracing();
    let (agent_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);
    let (bridge_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();
    let abort = CancellationToken::new();

    let input: Option<agent_relay::bridge::process::ProcessInput> = if with_stdin {
        Some(Box::new(bridge_stdin))
    } else {
        drop(bridge_stdin);
        None
    };

    let handle = ProcessHandle::from_io(input, Box::new(bridge_stdout), exit_rx, kill.clone());
    let bridge = Arc::new(AgentBridge::new(handle, handler, abort.clone()));

    BridgeHarness {
        bridge,
        agent_stdout,
        agent_stdin: BufReader::new(agent_stdin).lines(),
        exit_tx,
        kill,
        abort,
    }
}

impl BridgeHarness {
    /// Emit one NDJSON line on the agent's stdout.
    pub async fn emit(&mut self, value: &Value) {
        let mut bytes = serde_json::to_vec(value).expect("serialise test line");
        bytes.push(b'\n');
        self.agent_stdout
            .write_all(&bytes)
            .await
            .expect("write agent stdout");
    }

    /// Read the next line the bridge wrote to the agent, parsed as JSON.
    pub async fn next_written(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.agent_stdin.next_line())
            .await
            .expect("timed out waiting for a bridge write")
            .expect("stdin pipe")
            .expect("stdin closed before a line arrived");
        serde_json::from_str(&line).expect("bridge writes must be valid JSON")
    }

    /// Close agent stdout and publish an exit outcome.
    pub async fn finish_process(mut self, code: Option<i32>, stderr_tail: &str) -> Self {
        self.agent_stdout
            .shutdown()
            .await
            .expect("shutdown agent stdout");
        self.exit_tx
            .send(Some(ExitOutcome {
                code,
                stderr_tail: stderr_tail.to_owned(),
            }))
            .expect("publish exit outcome");
        self
    }
}
