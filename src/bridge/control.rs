//! Control channel over one agent subprocess.
//!
//! [`AgentBridge`] owns the process handle exclusively and multiplexes its
//! NDJSON stdout into four paths, classified in fixed order:
//!
//! 1. `control_response` — resolve the matching pending outbound request;
//!    unmatched ids are dropped silently.
//! 2. `control_request` — answer asynchronously via the
//!    [`PermissionHandler`] callback, replying with the same request id.
//! 3. `control_cancel_request` — cancel the matching inbound scope.
//! 4. anything else — an application message, enqueued to the relay
//!    stream.
//!
//! Malformed lines are logged and dropped, never fatal. Exit code 0, or a
//! signal kill caused by an external abort, ends the stream cleanly;
//! any other exit surfaces exactly one error through the relay, with an
//! already-tripped abort taking precedence over exit-code interpretation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::codec::LineCodec;
use crate::bridge::process::{ExitOutcome, ProcessHandle, ProcessInput, ProcessOutput};
use crate::bridge::wire::{self, InboundLine, SUBTYPE_CAN_USE_TOOL};
use crate::config::BridgeConfig;
use crate::relay::{self, RelayHandle, RelayStream};
use crate::{AppError, Result};

/// Permission callback: decide whether the agent may use a tool.
///
/// Invoked once per inbound `can_use_tool` control request, on its own
/// task. `cancel` fires when the agent retracts the request via
/// `control_cancel_request` or the session is torn down.
pub trait PermissionHandler: Send + Sync {
    /// Produce the decision payload written back in the success response.
    ///
    /// # Errors
    ///
    /// An error becomes an error-subtype control response carrying the
    /// message; it never crashes the bridge.
    fn can_use_tool(
        &self,
        tool_name: String,
        input: Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;
}

type PendingTable = StdMutex<HashMap<String, oneshot::Sender<Result<Value>>>>;
type ScopeTable = StdMutex<HashMap<String, CancellationToken>>;

struct BridgeInner {
    /// Per-instance identifier, for diagnostics only.
    id: Uuid,
    /// Outstanding outbound control requests by id.
    pending: PendingTable,
    /// Cancellation scopes for inbound control requests by id.
    inbound_scopes: ScopeTable,
    /// Single logical writer to the agent's stdin; `None` once closed or
    /// when spawned without one. Concurrent writes would corrupt the
    /// line-delimited wire format, so every write goes through this lock.
    writer: Mutex<Option<ProcessInput>>,
    has_input: bool,
    abort: CancellationToken,
    kill: CancellationToken,
    relay_tx: RelayHandle<Value>,
    exit: watch::Receiver<Option<ExitOutcome>>,
    handler: Arc<dyn PermissionHandler>,
}

/// Bridge between one agent subprocess and the session-sync layer.
pub struct AgentBridge {
    inner: Arc<BridgeInner>,
    /// Consumer side of the relay stream, handed out exactly once.
    stream: StdMutex<Option<RelayStream<Value>>>,
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("id", &self.inner.id)
            .field("has_input", &self.inner.has_input)
            .finish_non_exhaustive()
    }
}

impl AgentBridge {
    /// Spawn the agent described by `config` and bridge it.
    ///
    /// `abort` is the external abort signal: tripping it kills the
    /// process, abandons outstanding control requests, and ends the relay
    /// stream with an abort error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] when the OS spawn fails.
    pub fn spawn(
        config: &BridgeConfig,
        handler: Arc<dyn PermissionHandler>,
        abort: CancellationToken,
    ) -> Result<Self> {
        let handle = ProcessHandle::spawn(config)?;
        Ok(Self::new(handle, handler, abort))
    }

    /// Bridge an already-connected [`ProcessHandle`].
    #[must_use]
    pub fn new(
        handle: ProcessHandle,
        handler: Arc<dyn PermissionHandler>,
        abort: CancellationToken,
    ) -> Self {
        let kill = handle.kill_token();
        let has_input = handle.has_input();

        // Early consumer drop releases the subprocess.
        let teardown_kill = kill.clone();
        let (relay_tx, stream) =
            relay::channel_with_teardown(move || teardown_kill.cancel());

        let inner = Arc::new(BridgeInner {
            id: Uuid::new_v4(),
            pending: StdMutex::new(HashMap::new()),
            inbound_scopes: StdMutex::new(HashMap::new()),
            writer: Mutex::new(handle.input),
            has_input,
            abort: abort.clone(),
            kill,
            relay_tx,
            exit: handle.exit.clone(),
            handler,
        });

        tokio::spawn(run_reader(Arc::clone(&inner), handle.output));
        tokio::spawn(run_abort_watcher(Arc::clone(&inner)));

        Self {
            inner,
            stream: StdMutex::new(Some(stream)),
        }
    }

    /// Take the lazy sequence of inbound application messages.
    ///
    /// The sequence ends after the agent's output closes and the exit
    /// signal has fired.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Usage`] on a second call: the stream is
    /// consumable exactly once.
    pub fn iterate(&self) -> Result<RelayStream<Value>> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Usage("relay stream already taken".into()))
    }

    /// Send an outbound control request and await the matching response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Usage`] — the agent has no writable input.
    /// - [`AppError::Control`] — the agent answered with an error subtype.
    /// - [`AppError::Process`] / [`AppError::Aborted`] — the process exited
    ///   or the session aborted before a response arrived.
    pub async fn request(&self, request: Value) -> Result<Value> {
        if !self.inner.has_input {
            return Err(AppError::Usage(
                "agent has no writable input channel".into(),
            ));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_std(&self.inner.pending).insert(request_id.clone(), tx);

        let envelope = wire::control_request(&request_id, request);
        if let Err(err) = write_line(&self.inner, &envelope).await {
            lock_std(&self.inner.pending).remove(&request_id);
            return Err(err);
        }

        debug!(bridge_id = %self.inner.id, request_id, "control request sent");
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Aborted("control channel closed".into())),
        }
    }

    /// Send an `interrupt` control request and await its acknowledgement.
    ///
    /// # Errors
    ///
    /// Same surface as [`request`](Self::request); fails immediately with
    /// [`AppError::Usage`] when the agent was spawned without stdin.
    pub async fn interrupt(&self) -> Result<()> {
        self.request(wire::interrupt_request()).await.map(|_| ())
    }

    /// Await process termination; resolves once per process, to the same
    /// outcome for every caller.
    pub async fn wait_for_exit(&self) -> ExitOutcome {
        let mut rx = self.inner.exit.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Monitor dropped without publishing; treat as signal kill.
                return ExitOutcome {
                    code: None,
                    stderr_tail: String::new(),
                };
            }
        }
    }

    /// Whether the agent has a writable input channel.
    #[must_use]
    pub fn has_input(&self) -> bool {
        self.inner.has_input
    }

    /// Hard-kill the agent process. Idempotent.
    pub fn kill(&self) {
        self.inner.kill.cancel();
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Grace period for reading lines still buffered in the stdout pipe after
/// the exit signal fires.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Drive the framed reader over the agent's stdout, then settle the relay
/// stream from the exit outcome.
///
/// The read races the exit signal: a descendant of the dead agent can
/// inherit the stdout pipe and never close it, so EOF alone cannot be the
/// stop condition.
async fn run_reader(inner: Arc<BridgeInner>, output: ProcessOutput) {
    let mut framed = FramedRead::new(output, LineCodec::new());
    let mut exit = inner.exit.clone();

    loop {
        if exit.borrow().is_some() {
            drain_buffered(&inner, &mut framed).await;
            break;
        }
        tokio::select! {
            item = framed.next() => match item {
                Some(Ok(line)) => dispatch_line(&inner, &line),
                Some(Err(AppError::Parse(msg))) => {
                    warn!(bridge_id = %inner.id, error = %msg, "reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(bridge_id = %inner.id, error = %err, "reader: IO error, stopping");
                    break;
                }
                None => {
                    debug!(bridge_id = %inner.id, "reader: agent output closed");
                    break;
                }
            },
            changed = exit.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    settle_exit(&inner).await;
}

/// After exit: deliver lines already sitting in the pipe, bounding each
/// read so an open-but-idle pipe cannot stall settlement.
async fn drain_buffered(
    inner: &Arc<BridgeInner>,
    framed: &mut FramedRead<ProcessOutput, LineCodec>,
) {
    loop {
        match tokio::time::timeout(EXIT_DRAIN_WINDOW, framed.next()).await {
            Ok(Some(Ok(line))) => dispatch_line(inner, &line),
            Ok(Some(Err(AppError::Parse(msg)))) => {
                warn!(bridge_id = %inner.id, error = %msg, "reader: framing error, skipping");
            }
            Ok(Some(Err(_)) | None) | Err(_) => break,
        }
    }
}

/// Classify one line and route it.
fn dispatch_line(inner: &Arc<BridgeInner>, line: &str) {
    match wire::classify_line(line) {
        Ok(None) => {}
        Ok(Some(InboundLine::ControlResponse { request_id, result })) => {
            let entry = lock_std(&inner.pending).remove(&request_id);
            if let Some(tx) = entry {
                let _ = tx.send(result);
            } else {
                debug!(bridge_id = %inner.id, request_id, "response for unknown id, dropped");
            }
        }
        Ok(Some(InboundLine::ControlRequest {
            request_id,
            subtype,
            payload,
        })) => handle_control_request(inner, request_id, &subtype, payload),
        Ok(Some(InboundLine::ControlCancel { request_id })) => {
            let scope = lock_std(&inner.inbound_scopes).remove(&request_id);
            if let Some(token) = scope {
                debug!(bridge_id = %inner.id, request_id, "inbound request cancelled by agent");
                token.cancel();
            }
        }
        Ok(Some(InboundLine::Application(value))) => {
            inner.relay_tx.enqueue(value);
        }
        Err(err) => {
            warn!(bridge_id = %inner.id, error = %err, raw_line = line, "reader: parse error, skipping line");
        }
    }
}

/// Answer an inbound control request on its own task.
fn handle_control_request(
    inner: &Arc<BridgeInner>,
    request_id: String,
    subtype: &str,
    payload: Value,
) {
    if subtype != SUBTYPE_CAN_USE_TOOL {
        let reply = wire::control_response_error(
            &request_id,
            &format!("unsupported control request subtype: {subtype}"),
        );
        spawn_reply(Arc::clone(inner), reply);
        return;
    }

    let tool_name = payload
        .get("tool_name")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let Some(tool_name) = tool_name else {
        let reply = wire::control_response_error(
            &request_id,
            "malformed can_use_tool request: missing tool_name",
        );
        spawn_reply(Arc::clone(inner), reply);
        return;
    };
    let input = payload.get("input").cloned().unwrap_or(Value::Null);

    let scope = CancellationToken::new();
    lock_std(&inner.inbound_scopes).insert(request_id.clone(), scope.clone());

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let decision = inner
            .handler
            .can_use_tool(tool_name, input, scope)
            .await;
        lock_std(&inner.inbound_scopes).remove(&request_id);

        let reply = match decision {
            Ok(value) => wire::control_response_success(&request_id, value),
            Err(err) => wire::control_response_error(&request_id, &err.to_string()),
        };
        if let Err(err) = write_line(&inner, &reply).await {
            warn!(bridge_id = %inner.id, request_id, error = %err, "failed to write control response");
        }
    });
}

/// Write one pre-built reply envelope, logging failures.
fn spawn_reply(inner: Arc<BridgeInner>, reply: Value) {
    tokio::spawn(async move {
        if let Err(err) = write_line(&inner, &reply).await {
            warn!(bridge_id = %inner.id, error = %err, "failed to write control response");
        }
    });
}

/// After EOF: await the exit signal, settle the relay, and clean up every
/// outstanding request and scope.
async fn settle_exit(inner: &Arc<BridgeInner>) {
    let outcome = {
        let mut rx = inner.exit.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if rx.changed().await.is_err() {
                break ExitOutcome {
                    code: None,
                    stderr_tail: String::new(),
                };
            }
        }
    };

    // Abort wins over exit-code interpretation.
    if inner.abort.is_cancelled() {
        inner
            .relay_tx
            .raise_error(AppError::Aborted("session aborted".into()));
        abandon_outstanding(inner, &AppError::Aborted("session aborted".into()));
    } else if outcome.is_clean() {
        inner.relay_tx.mark_done();
        abandon_outstanding(
            inner,
            &AppError::Process("agent exited before responding".into()),
        );
    } else {
        let message = outcome.code.map_or_else(
            || format!("agent terminated by signal: {}", outcome.stderr_tail),
            |code| format!("agent exited with code {code}: {}", outcome.stderr_tail),
        );
        inner.relay_tx.raise_error(AppError::Process(message));
        abandon_outstanding(
            inner,
            &AppError::Process("agent exited before responding".into()),
        );
    }

    // Release the input handle; the process is gone.
    *inner.writer.lock().await = None;
}

/// Reject every pending outbound request and cancel every inbound scope.
fn abandon_outstanding(inner: &Arc<BridgeInner>, err: &AppError) {
    let pending: Vec<_> = lock_std(&inner.pending).drain().collect();
    for (request_id, tx) in pending {
        debug!(bridge_id = %inner.id, request_id, "abandoning pending control request");
        let _ = tx.send(Err(err.clone()));
    }

    let scopes: Vec<_> = lock_std(&inner.inbound_scopes).drain().collect();
    for (_, token) in scopes {
        token.cancel();
    }
}

// ── Abort watcher ─────────────────────────────────────────────────────────────

/// Tie the external abort signal to subprocess kill and pending-request
/// abandonment. Ends silently when the process exits first.
async fn run_abort_watcher(inner: Arc<BridgeInner>) {
    let mut exit = inner.exit.clone();
    tokio::select! {
        () = inner.abort.cancelled() => {
            debug!(bridge_id = %inner.id, "abort signal tripped, killing agent");
            inner.kill.cancel();
            abandon_outstanding(&inner, &AppError::Aborted("session aborted".into()));
        }
        _ = exit.changed() => {}
    }
}

// ── Write path ────────────────────────────────────────────────────────────────

/// Serialise `value` to one NDJSON line and write it under the writer lock.
async fn write_line(inner: &BridgeInner, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|e| AppError::Parse(format!("failed to serialise outbound message: {e}")))?;
    bytes.push(b'\n');

    let mut guard = inner.writer.lock().await;
    let Some(writer) = guard.as_mut() else {
        return Err(AppError::Process("agent input channel closed".into()));
    };
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| AppError::Process(format!("write to agent failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::Process(format!("write to agent failed: {e}")))
}

/// Lock a std mutex, recovering from poisoning.
fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
