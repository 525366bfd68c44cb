//! Push/pull relay stream.
//!
//! Adapts push-based line arrivals (the bridge's reader task) into
//! pull-based iteration for a single consumer. The state machine is
//! explicit:
//!
//! - `Active { buffer, waiter }` — live; values queue up, or hand off
//!   directly to a parked reader. The buffer and a waiter are never
//!   simultaneously non-empty.
//! - `Errored(err)` — terminal; the stored error is yielded exactly once,
//!   after which the stream reports finished.
//! - `Finished` — terminal and sticky.
//!
//! Producer calls after a terminal transition are no-ops, so at most one
//! terminal error is ever reported per stream lifetime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::{AppError, Result};

/// Callback invoked when the consumer stops iterating early, used to
/// release upstream resources (e.g. kill the subprocess feeding the
/// stream).
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Value handed to a parked reader.
enum Pull<T> {
    Item(T),
    Finished,
    Failed(AppError),
}

/// Relay state machine.
enum State<T> {
    Active {
        buffer: VecDeque<T>,
        waiter: Option<oneshot::Sender<Pull<T>>>,
        done: bool,
        teardown: Option<Teardown>,
    },
    Errored(AppError),
    Finished,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// Per-instance identifier, for diagnostics only.
    id: Uuid,
}

impl<T> Inner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected producer/consumer pair.
#[must_use]
pub fn channel<T>() -> (RelayHandle<T>, RelayStream<T>) {
    build(None)
}

/// Create a pair whose consumer fires `teardown` if dropped while the
/// stream is still active.
#[must_use]
pub fn channel_with_teardown<T>(teardown: impl FnOnce() + Send + 'static) -> (RelayHandle<T>, RelayStream<T>) {
    build(Some(Box::new(teardown)))
}

fn build<T>(teardown: Option<Teardown>) -> (RelayHandle<T>, RelayStream<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Active {
            buffer: VecDeque::new(),
            waiter: None,
            done: false,
            teardown,
        }),
        id: Uuid::new_v4(),
    });
    (
        RelayHandle {
            inner: Arc::clone(&inner),
        },
        RelayStream { inner },
    )
}

// ── Producer side ─────────────────────────────────────────────────────────────

/// Producer handle: push values and terminal signals into the stream.
///
/// Cloneable; all clones feed the same consumer.
pub struct RelayHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RelayHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RelayHandle<T> {
    /// Push a value: hand it directly to a parked reader if one exists,
    /// otherwise buffer it. Dropped silently after a terminal transition
    /// or once `mark_done` was called.
    pub fn enqueue(&self, value: T) {
        let mut guard = self.inner.lock();
        match &mut *guard {
            State::Active {
                buffer,
                waiter,
                done: false,
                ..
            } => {
                if let Some(tx) = waiter.take() {
                    if let Err(Pull::Item(v)) = tx.send(Pull::Item(value)) {
                        // Reader future was cancelled after parking; keep
                        // the value for the next pull.
                        buffer.push_back(v);
                    }
                } else {
                    buffer.push_back(value);
                }
            }
            State::Active { done: true, .. } => {
                debug!(stream_id = %self.inner.id, "relay: value after completion signal, dropped");
            }
            State::Errored(_) | State::Finished => {
                debug!(stream_id = %self.inner.id, "relay: value after terminal state, dropped");
            }
        }
    }

    /// Signal completion. Buffered values still drain before the finished
    /// signal reaches the consumer. No-op on a terminal stream.
    pub fn mark_done(&self) {
        let mut guard = self.inner.lock();
        if let State::Active {
            buffer,
            waiter,
            done,
            ..
        } = &mut *guard
        {
            *done = true;
            if buffer.is_empty() {
                if let Some(tx) = waiter.take() {
                    let _ = tx.send(Pull::Finished);
                }
                *guard = State::Finished;
            }
        }
    }

    /// Signal failure. Exactly one pending or future pull fails with
    /// `err`; buffered values are discarded. No-op on a terminal stream.
    pub fn raise_error(&self, err: AppError) {
        let mut guard = self.inner.lock();
        if let State::Active { buffer, waiter, .. } = &mut *guard {
            if !buffer.is_empty() {
                debug!(
                    stream_id = %self.inner.id,
                    discarded = buffer.len(),
                    "relay: error raised with buffered values"
                );
            }
            if let Some(tx) = waiter.take() {
                match tx.send(Pull::Failed(err)) {
                    Ok(()) => *guard = State::Finished,
                    Err(Pull::Failed(e)) => *guard = State::Errored(e),
                    Err(_) => *guard = State::Finished,
                }
            } else {
                *guard = State::Errored(err);
            }
        }
    }

    /// Whether the stream has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(&*self.inner.lock(), State::Active { .. })
    }
}

// ── Consumer side ─────────────────────────────────────────────────────────────

/// Consumer side: a lazy, finite sequence of `T`, consumable exactly once.
///
/// Ownership enforces the single-consumer contract; handing the stream out
/// twice is the embedding type's responsibility (see
/// [`AgentBridge::iterate`](crate::bridge::AgentBridge::iterate)).
pub struct RelayStream<T> {
    inner: Arc<Inner<T>>,
}

impl<T> std::fmt::Debug for RelayStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl<T> RelayStream<T> {
    /// Pull the next value.
    ///
    /// Resolves immediately when a value is buffered, otherwise suspends
    /// until the producer enqueues, finishes, or fails the stream.
    ///
    /// Returns `Some(Ok(value))` per value in FIFO order, then either
    /// `Some(Err(err))` exactly once (failed stream) or `None` (finished).
    /// After an error, subsequent pulls return `None`.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let rx = {
            let mut guard = self.inner.lock();
            match &mut *guard {
                State::Active {
                    buffer,
                    waiter,
                    done,
                    ..
                } => {
                    if let Some(value) = buffer.pop_front() {
                        if buffer.is_empty() && *done {
                            *guard = State::Finished;
                        }
                        return Some(Ok(value));
                    }
                    if *done {
                        *guard = State::Finished;
                        return None;
                    }
                    let (tx, rx) = oneshot::channel();
                    // A stale sender from a cancelled pull is replaced.
                    *waiter = Some(tx);
                    rx
                }
                State::Errored(_) => {
                    let State::Errored(err) = std::mem::replace(&mut *guard, State::Finished)
                    else {
                        return None;
                    };
                    return Some(Err(err));
                }
                State::Finished => return None,
            }
        };

        match rx.await {
            Ok(Pull::Item(value)) => Some(Ok(value)),
            Ok(Pull::Finished) | Err(_) => None,
            Ok(Pull::Failed(err)) => Some(Err(err)),
        }
    }
}

impl<T> Drop for RelayStream<T> {
    /// Fire the teardown callback when iteration stops early.
    fn drop(&mut self) {
        let teardown = {
            let mut guard = self.inner.lock();
            if let State::Active { teardown, .. } = &mut *guard {
                let cb = teardown.take();
                *guard = State::Finished;
                cb
            } else {
                None
            }
        };
        if let Some(cb) = teardown {
            debug!(stream_id = %self.inner.id, "relay: consumer dropped early, running teardown");
            cb();
        }
    }
}
