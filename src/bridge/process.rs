//! Agent process spawning and lifecycle plumbing.
//!
//! Spawns the agent binary with:
//! - `kill_on_drop(true)` so no process handle leaks on any exit path.
//! - `env_clear()` + a safe variable allowlist so host secrets are never
//!   visible to the child.
//! - piped stderr drained into a bounded tail buffer, included in the
//!   exit-error message when the process fails.
//!
//! The resulting [`ProcessHandle`] is the bridge's exclusive view of the
//! child: optional writable input, readable output, a single-fire exit
//! signal, and a kill token.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{BridgeConfig, StdinMode};
use crate::{AppError, Result};

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable is stripped via `env_clear()` before the child is
/// launched, so session tokens and other secrets held by the embedding
/// service never reach the agent's environment.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Boxed writable input to the agent process.
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed readable output from the agent process.
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Shared ring buffer of the most recent stderr lines.
type TailBuffer = Arc<StdMutex<VecDeque<String>>>;

/// How long the exit monitor waits for stderr EOF after the child dies.
/// Descendants inheriting the pipe can hold it open indefinitely, so the
/// tail is snapshotted from [`TailBuffer`] once this window elapses.
const STDERR_DRAIN_WINDOW: Duration = Duration::from_millis(200);

// ── Exit signal ───────────────────────────────────────────────────────────────

/// Terminal state of the agent process, published exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Process exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Last stderr lines emitted before exit, newline-joined.
    pub stderr_tail: String,
}

impl ExitOutcome {
    /// Whether the process exited cleanly (code 0).
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

// ── Process handle ────────────────────────────────────────────────────────────

/// Exclusive handle to one agent subprocess.
///
/// Owned by the control bridge; torn down when the exit signal fires.
pub struct ProcessHandle {
    /// Writable input; `None` in one-shot / no-stdin mode.
    pub(crate) input: Option<ProcessInput>,
    /// Readable NDJSON output.
    pub(crate) output: ProcessOutput,
    /// Single-fire exit signal: transitions from `None` to `Some` exactly
    /// once when the process terminates.
    pub(crate) exit: watch::Receiver<Option<ExitOutcome>>,
    /// Cancelling this token kills the process.
    kill: CancellationToken,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("has_input", &self.input.is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Spawn the agent binary described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Process`] when the OS spawn fails or a piped
    /// stream cannot be captured.
    pub fn spawn(config: &BridgeConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.agent_cmd);
        cmd.args(&config.agent_args);

        // Strip inherited environment, then inject only the safe allowlist.
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        let stdin_cfg = match config.stdin_mode {
            StdinMode::Piped => std::process::Stdio::piped(),
            StdinMode::Closed => std::process::Stdio::null(),
        };

        cmd.current_dir(&config.workspace_root)
            .stdin(stdin_cfg)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Process(format!("failed to spawn agent: {err}")))?;

        let input: Option<ProcessInput> = match config.stdin_mode {
            StdinMode::Piped => {
                let stdin = child.stdin.take().ok_or_else(|| {
                    AppError::Process("failed to capture agent stdin".into())
                })?;
                Some(Box::new(stdin))
            }
            StdinMode::Closed => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stderr".into()))?;

        let (tail, stderr_task) = spawn_stderr_tail(stderr, config.stderr_tail_lines);
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_exit_monitor(child, tail, stderr_task, kill.clone(), exit_tx);

        Ok(Self {
            input,
            output: Box::new(stdout),
            exit: exit_rx,
            kill,
        })
    }

    /// Build a handle from raw streams, for embedding over non-child IO.
    ///
    /// The caller publishes the exit outcome through the paired
    /// [`watch::Sender`]; cancelling `kill` is the caller's kill signal.
    #[must_use]
    pub fn from_io(
        input: Option<ProcessInput>,
        output: ProcessOutput,
        exit: watch::Receiver<Option<ExitOutcome>>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            input,
            output,
            exit,
            kill,
        }
    }

    /// Whether the handle carries a writable input channel.
    #[must_use]
    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Hard-kill the process. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Clone of the kill token, for cancellation wiring.
    #[must_use]
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Drain stderr into a bounded ring buffer shared with the exit monitor.
fn spawn_stderr_tail(stderr: ChildStderr, max_lines: usize) -> (TailBuffer, JoinHandle<()>) {
    let tail: TailBuffer = Arc::new(StdMutex::new(VecDeque::with_capacity(max_lines)));
    let buffer = Arc::clone(&tail);
    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut tail = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == max_lines {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "stderr tail: read error, stopping");
                    break;
                }
            }
        }
    });
    (tail, task)
}

/// Await child exit (or a kill signal) and publish the outcome exactly once.
///
/// The stderr tail is snapshotted from the shared buffer rather than joined
/// at EOF: a descendant of the dead child can keep the pipe open, and exit
/// publication must not wait on it.
fn spawn_exit_monitor(
    mut child: Child,
    tail: TailBuffer,
    mut stderr_task: JoinHandle<()>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            biased;

            () = kill.cancelled() => {
                debug!("exit monitor: kill requested");
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "exit monitor: kill failed");
                }
                child.wait().await
            }
            status = child.wait() => status,
        };

        let _ = tokio::time::timeout(STDERR_DRAIN_WINDOW, &mut stderr_task).await;
        stderr_task.abort();
        let stderr_tail = {
            let tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        };
        let code = match status {
            Ok(s) => s.code(),
            Err(err) => {
                warn!(error = %err, "exit monitor: wait failed");
                None
            }
        };

        debug!(?code, "agent process exited");
        let _ = exit_tx.send(Some(ExitOutcome { code, stderr_tail }));
    });
}
