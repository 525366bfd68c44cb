//! Ordered, release-gated outgoing delivery queue.
//!
//! Messages bound for the session-sync transport are tagged with a
//! monotonic sequence id at enqueue time and flushed to the sink strictly
//! in that order. Two mechanisms release an item early: a fixed hold-back
//! timer, or an explicit release keyed to a tool-call identifier. A later,
//! released item never overtakes an earlier, unreleased one.
//!
//! The motivating case: an intermediate "thinking" message can be held
//! back until it is clear whether its associated tool call resolves
//! quickly (avoiding flicker), while later unrelated messages never jump
//! ahead of it.
//!
//! Every mutation is serialised through one `tokio::sync::Mutex` so timer
//! firings, external releases, and new enqueues cannot interleave
//! inconsistently. A processing pass triggered by a mutation is deferred
//! one scheduling tick so a burst of synchronous calls coalesces into a
//! single pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;

/// Outgoing message sink, implemented by the transport collaborator.
///
/// Errors returned from [`deliver`](Self::deliver) are logged and the
/// message is counted as sent; they never break queue ordering invariants.
pub trait DeliverySink: Send + Sync {
    /// Deliver one message to the remote side.
    ///
    /// # Errors
    ///
    /// Implementations report transport failures; the queue logs them and
    /// moves on.
    fn deliver(&self, message: &Value) -> Result<()>;
}

impl<F> DeliverySink for F
where
    F: Fn(&Value) -> Result<()> + Send + Sync,
{
    fn deliver(&self, message: &Value) -> Result<()> {
        self(message)
    }
}

/// Per-message enqueue options.
#[derive(Default)]
pub struct EnqueueOptions {
    /// Hold the message back for this long unless released earlier.
    pub delay: Option<Duration>,
    /// Tool-call ids whose completion releases the message.
    pub tool_call_ids: Vec<String>,
    /// Internal/system message: never delivered to the sink, but still
    /// counted as sent so ordering bookkeeping stays intact.
    pub internal: bool,
}

/// One queued message.
struct QueueItem {
    seq: u64,
    payload: Value,
    released: bool,
    sent: bool,
    internal: bool,
    tool_call_ids: Vec<String>,
    /// Self-release timer; aborted when the item is released another way.
    timer: Option<JoinHandle<()>>,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    next_seq: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    sink: Box<dyn DeliverySink>,
    /// Coalesces deferred processing passes.
    pass_scheduled: AtomicBool,
    destroyed: AtomicBool,
}

/// Ordered delivery queue; cheap to clone, all clones share one queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create a queue draining into `sink`.
    #[must_use]
    pub fn new(sink: impl DeliverySink + 'static) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    next_seq: 1,
                }),
                sink: Box::new(sink),
                pass_scheduled: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a message and return its sequence id.
    ///
    /// Without a delay the item is released immediately; with one, a
    /// self-release timer is armed. Either way a deferred processing pass
    /// is triggered. Enqueues after [`destroy`](Self::destroy) are dropped.
    pub async fn enqueue(&self, payload: Value, options: EnqueueOptions) -> u64 {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            debug!("queue: enqueue after destroy, dropping message");
            return 0;
        }

        let seq = {
            let mut state = self.inner.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;

            let timer = options.delay.map(|delay| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    release_seq(&inner, seq).await;
                })
            });

            state.items.push_back(QueueItem {
                seq,
                payload,
                released: options.delay.is_none(),
                sent: false,
                internal: options.internal,
                tool_call_ids: options.tool_call_ids,
                timer,
            });
            seq
        };

        schedule_pass(&self.inner);
        seq
    }

    /// Release every unreleased item whose tool-call ids contain `id`.
    ///
    /// Idempotent: repeated calls never re-deliver an already-sent item
    /// and never error.
    pub async fn release_tool_call(&self, id: &str) {
        let mut touched = false;
        {
            let mut state = self.inner.state.lock().await;
            for item in &mut state.items {
                if !item.released && !item.sent && item.tool_call_ids.iter().any(|t| t == id) {
                    release_item(item);
                    touched = true;
                }
            }
        }
        if touched {
            schedule_pass(&self.inner);
        }
    }

    /// Force-release everything and process synchronously (teardown path).
    pub async fn flush(&self) {
        let mut state = self.inner.state.lock().await;
        for item in &mut state.items {
            if !item.released {
                release_item(item);
            }
        }
        process_locked(&self.inner, &mut state);
    }

    /// Cancel all timers without flushing (hard stop).
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        for item in &mut state.items {
            if let Some(timer) = item.timer.take() {
                timer.abort();
            }
        }
    }

    /// Number of items currently queued (unsent head-of-line included).
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    /// Whether the queue holds no items.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Mark one item released and disarm its timer. Caller holds the lock.
fn release_item(item: &mut QueueItem) {
    item.released = true;
    if let Some(timer) = item.timer.take() {
        timer.abort();
    }
}

/// Timer self-release for the item with sequence id `seq`.
async fn release_seq(inner: &Arc<QueueInner>, seq: u64) {
    {
        let mut state = inner.state.lock().await;
        let Some(item) = state.items.iter_mut().find(|i| i.seq == seq) else {
            return;
        };
        if item.released {
            return;
        }
        release_item(item);
    }
    schedule_pass(inner);
}

/// Schedule a processing pass on the next scheduling tick, coalescing a
/// burst of triggers into one pass.
fn schedule_pass(inner: &Arc<QueueInner>) {
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    if inner.pass_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        inner.pass_scheduled.store(false, Ordering::SeqCst);
        // A destroy may have landed between scheduling and this tick.
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = inner.state.lock().await;
        process_locked(&inner, &mut state);
    });
}

/// Deliver released items from the head; stop at the first unreleased one.
///
/// A sink failure is logged and the item still counts as sent — ordering
/// invariants survive a misbehaving sink.
fn process_locked(inner: &QueueInner, state: &mut QueueState) {
    while let Some(head) = state.items.front_mut() {
        if !head.released {
            break;
        }
        if !head.sent {
            if head.internal {
                debug!(seq = head.seq, "queue: internal message, skipped delivery");
            } else if let Err(err) = inner.sink.deliver(&head.payload) {
                warn!(seq = head.seq, error = %err, "queue: sink delivery failed");
            }
            head.sent = true;
        }
        state.items.pop_front();
    }
}
