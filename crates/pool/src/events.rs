//! Event broadcasting for state lifecycle observability.
//!
//! Provides [`PoolEvent`] variants emitted by the [`Manager`](crate::Manager)
//! and an [`EventBus`] backed by `tokio::sync::broadcast`.

use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::status::Status;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted during pool operations.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A new Lua state was built and counted against capacity.
    Created {
        /// The state identifier.
        state_id: Uuid,
    },
    /// A state was checked out.
    Acquired {
        /// The state identifier.
        state_id: Uuid,
    },
    /// A state was returned to the idle list.
    Released {
        /// The state identifier.
        state_id: Uuid,
        /// How long the state was checked out.
        usage_duration: Duration,
    },
    /// A state was closed and removed from the pool.
    CleanedUp {
        /// The state identifier.
        state_id: Uuid,
        /// Why it was closed.
        reason: CleanupReason,
    },
    /// A checkout was refused because every slot is in use.
    PoolFull {
        /// Configured capacity.
        max_num: usize,
    },
    /// The pool moved to a new status.
    StatusChanged {
        /// Previous status.
        from: Status,
        /// New status.
        to: Status,
    },
}

// ---------------------------------------------------------------------------
// CleanupReason
// ---------------------------------------------------------------------------

/// Reason a state was permanently removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The state served its configured number of requests.
    RequestBudget,
    /// The state outlived its idle timeout.
    IdleTimeout,
    /// A chunk failed while running on the state.
    ScriptFailure,
    /// The pool is shutting down.
    Shutdown,
    /// The state was returned while the pool was exiting.
    Rejected,
    /// The caller closed the state explicitly.
    Discarded,
    /// The context the state was created under was cancelled.
    Cancelled,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool events.
///
/// Emission is fire-and-forget: with no subscribers, or a full channel,
/// events are dropped and the emitter never blocks.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // No receivers is not an error for the pool.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    ///
    /// A subscriber that falls more than `buffer_size` events behind receives
    /// a `Lagged` error and skips to the latest.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}
