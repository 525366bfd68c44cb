//! Per-turn cancellation scope.
//!
//! A [`TurnScope`] ties one prompt-and-response cycle to the resources it
//! holds: the agent subprocess, the tool-call ids it opened, and the
//! delivery-queue items gated on them. Cancelling the scope interrupts
//! the agent (or kills it when no input channel exists), releases every
//! registered tool call so the consumer is never left waiting on an item
//! that will never resolve, and is idempotent throughout.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::AgentBridge;
use crate::queue::DeliveryQueue;

/// Cancellation scope for one active turn.
pub struct TurnScope {
    bridge: Arc<AgentBridge>,
    queue: DeliveryQueue,
    token: CancellationToken,
    /// Tool-call ids opened during this turn. Ids are scoped to the turn;
    /// reuse across turns would release the wrong items.
    tool_calls: Mutex<HashSet<String>>,
    settled: AtomicBool,
}

impl TurnScope {
    /// Open a scope for a new turn.
    #[must_use]
    pub fn new(bridge: Arc<AgentBridge>, queue: DeliveryQueue) -> Self {
        Self {
            bridge,
            queue,
            token: CancellationToken::new(),
            tool_calls: Mutex::new(HashSet::new()),
            settled: AtomicBool::new(false),
        }
    }

    /// Record a tool-call id opened during this turn.
    pub fn register_tool_call(&self, id: impl Into<String>) {
        self.tool_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    /// Mark the turn complete; a later [`cancel`](Self::cancel) is a no-op.
    pub fn finish(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    /// Cancel the turn.
    ///
    /// Interrupts the agent when a writable input exists, hard-kills the
    /// process otherwise, then releases every queued item tied to this
    /// turn. Cancelling a finished or already-cancelled turn is a no-op,
    /// never an error.
    pub async fn cancel(&self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        if self.bridge.has_input() {
            // Fire the interrupt without blocking teardown on its ack.
            let bridge = Arc::clone(&self.bridge);
            tokio::spawn(async move {
                if let Err(err) = bridge.interrupt().await {
                    warn!(error = %err, "turn cancel: interrupt failed");
                }
            });
        } else {
            debug!("turn cancel: no input channel, killing agent");
            self.bridge.kill();
        }

        let ids: Vec<String> = self
            .tool_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for id in ids {
            self.queue.release_tool_call(&id).await;
        }
    }

    /// Token observed by work running inside this turn.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the turn has finished or been cancelled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}
