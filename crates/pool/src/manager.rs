//! Pool manager: a bounded pool of Lua states.
//!
//! All mutable pool state (idle list, counters, status) lives behind one
//! mutex. A condition variable on the same mutex lets [`Manager::shutdown`]
//! wait until every checked-out state has come back.
//!
//! `get` never waits for capacity: when every slot is in use it fails with
//! [`Error::PoolFull`] and leaves backpressure to the caller.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{Config, StateOptions};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::{CleanupReason, EventBus, PoolEvent};
use crate::guard::StateGuard;
use crate::state::{InitHook, LState};
use crate::status::Status;

/// Point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Current status.
    pub status: Status,
    /// States allocated and not yet closed (idle + serving).
    pub length: usize,
    /// States waiting in the idle list.
    pub idle: usize,
    /// States currently checked out.
    pub serving: usize,
    /// Checkouts since the manager was created.
    pub total_requested: u64,
    /// Configured capacity (`0` = unbounded).
    pub max_num: usize,
}

/// Mutable pool state, guarded by `Inner::pool`.
struct PoolState {
    status: Status,
    /// LIFO: the most recently returned state is handed out first.
    idle: Vec<LState>,
    length: usize,
    serving_num: usize,
    total_requested_num: u64,
    /// Context new states derive their cancellation token from.
    root: Context,
}

struct Inner {
    config: RwLock<Config>,
    /// Serializes `shutdown`, `restart` and `terminate` against each other.
    lifecycle: Mutex<()>,
    init_hook: Option<InitHook>,
    pool: Mutex<PoolState>,
    drained: Condvar,
    events: EventBus,
}

/// Pool of Lua states.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("stats", &self.stats())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

/// The error `get` and `put` report for a pool that no longer accepts work.
fn refusal(status: Status) -> Error {
    if status.is_terminal() {
        Error::Dead
    } else {
        Error::Exiting
    }
}

impl Manager {
    /// Create a pool and seed it with `config.start_num()` states.
    ///
    /// New states derive their cancellation token from `ctx`; cancelling it
    /// aborts anything running on them and makes them retire on return.
    ///
    /// # Errors
    /// [`Error::Cancelled`] if `ctx` is already cancelled. Otherwise the
    /// allocation error if any seed state cannot be built; the states seeded
    /// so far are closed first.
    pub fn new(ctx: &Context, config: Config, init_hook: Option<InitHook>) -> Result<Self> {
        let manager = Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                lifecycle: Mutex::new(()),
                init_hook,
                pool: Mutex::new(PoolState {
                    status: Status::Ready,
                    idle: Vec::new(),
                    length: 0,
                    serving_num: 0,
                    total_requested_num: 0,
                    root: ctx.clone(),
                }),
                drained: Condvar::new(),
                events: EventBus::default(),
            }),
        };
        {
            let _lifecycle = manager.inner.lifecycle.lock();
            manager.start(ctx)?;
        }
        Ok(manager)
    }

    /// Create a pool with the built-in defaults: unbounded, one seed state,
    /// no request budget, `1h` idle timeout, `120s` request timeout.
    pub fn with_defaults(ctx: &Context, init_hook: Option<InitHook>) -> Result<Self> {
        Self::new(ctx, Config::default(), init_hook)
    }

    /// Seed the pool. Called with the lifecycle lock held.
    fn start(&self, ctx: &Context) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut pool = self.inner.pool.lock();
        if !pool.status.can_restart() {
            return Err(Error::Dead);
        }
        debug_assert_eq!(pool.serving_num, 0, "seeding with checked-out states");

        pool.idle.clear();
        pool.length = 0;
        pool.root = ctx.clone();
        // The lock is held until seeding finishes, so nobody observes a
        // half-seeded running pool.
        self.set_status(&mut pool, Status::Running);

        let start_num = self.inner.config.read().start_num();
        for _ in 0..start_num {
            let ls = match self.allocate(&mut pool) {
                Ok(ls) => ls,
                Err(e) => {
                    drop(pool);
                    warn!(error = %e, "seeding Lua state pool failed, shutting down");
                    self.drain();
                    return Err(e);
                }
            };
            pool.idle.push(ls);
        }

        info!(
            start_num,
            max_num = self.inner.config.read().max_num(),
            request_id = %ctx.request_id,
            "Lua state pool started"
        );
        Ok(())
    }

    /// Build a new state and count it against capacity. Called with the
    /// pool lock held.
    fn allocate(&self, pool: &mut PoolState) -> Result<LState> {
        let ls = {
            let config = self.inner.config.read();
            LState::create(
                &pool.root,
                config.max_request(),
                config.idle_timeout_secs(),
                config.state_options(),
                self.inner.init_hook.as_ref(),
            )?
        };
        pool.length += 1;
        debug!(state_id = %ls.id(), length = pool.length, "allocated Lua state");
        self.inner.events.emit(PoolEvent::Created { state_id: ls.id() });
        Ok(ls)
    }

    /// Check out a state.
    ///
    /// Reuses the most recently returned idle state, or builds a new one
    /// while capacity allows.
    ///
    /// # Errors
    /// - [`Error::Cancelled`] if `ctx` is already cancelled
    /// - [`Error::Exiting`] / [`Error::Dead`] once shutdown has begun
    /// - [`Error::PoolFull`] if every slot is checked out
    /// - [`Error::Initialization`] if a new state cannot be built
    pub fn get(&self, ctx: &Context) -> Result<LState> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut pool = self.inner.pool.lock();
        if !pool.status.is_accepting() {
            return Err(refusal(pool.status));
        }

        let mut ls = match pool.idle.pop() {
            Some(ls) => ls,
            None => {
                let max_num = self.inner.config.read().max_num();
                if max_num > 0 && pool.length >= max_num {
                    debug!(max_num, request_id = %ctx.request_id, "Lua state pool is full");
                    self.inner.events.emit(PoolEvent::PoolFull { max_num });
                    return Err(Error::PoolFull { max_num });
                }
                self.allocate(&mut pool)?
            }
        };

        ls.set_serving(true);
        ls.inc_request_num();
        pool.serving_num += 1;
        pool.total_requested_num += 1;

        debug!(
            state_id = %ls.id(),
            request_id = %ctx.request_id,
            metadata = ?ctx.metadata,
            serving = pool.serving_num,
            "checked out Lua state"
        );
        self.inner.events.emit(PoolEvent::Acquired { state_id: ls.id() });
        Ok(ls)
    }

    /// Check out a state wrapped in a guard that returns it on drop.
    pub fn acquire(&self, ctx: &Context) -> Result<StateGuard> {
        let ls = self.get(ctx)?;
        Ok(StateGuard::new(self.clone(), ls))
    }

    /// Return a checked-out state.
    ///
    /// States that used up their request budget or outlived their idle
    /// timeout are closed instead of requeued; that is routine and not an
    /// error.
    ///
    /// # Errors
    /// - [`Error::Closed`] if the state was already closed
    /// - [`Error::Exiting`] / [`Error::Dead`] if the pool is shutting down;
    ///   the state is closed
    pub fn put(&self, ls: LState) -> Result<()> {
        if ls.is_closed() {
            return Err(Error::Closed);
        }
        let mut pool = self.inner.pool.lock();
        self.put_locked(&mut pool, ls)
    }

    fn put_locked(&self, pool: &mut PoolState, mut ls: LState) -> Result<()> {
        if !pool.status.is_accepting() {
            warn!(state_id = %ls.id(), status = %pool.status, "Lua state returned while pool is exiting");
            self.retire_locked(pool, ls, CleanupReason::Rejected);
            return Err(refusal(pool.status));
        }

        if ls.must_terminate() {
            let reason = if self.inner.config.read().max_request() > 0 {
                CleanupReason::RequestBudget
            } else {
                CleanupReason::IdleTimeout
            };
            self.retire_locked(pool, ls, reason);
            return Ok(());
        }
        if ls.cancellation().is_cancelled() {
            self.retire_locked(pool, ls, CleanupReason::Cancelled);
            return Ok(());
        }

        if ls.is_serving() {
            self.release_slot(pool);
            if let Some(usage_duration) = ls.serving_for() {
                self.inner.events.emit(PoolEvent::Released {
                    state_id: ls.id(),
                    usage_duration,
                });
            }
        }
        ls.set_serving(false);
        debug!(state_id = %ls.id(), idle = pool.idle.len() + 1, "recycled Lua state");
        pool.idle.push(ls);
        Ok(())
    }

    /// Close a checked-out state and release its slot.
    ///
    /// # Panics
    /// Panics if the state is not checked out. Closing a state the pool does
    /// not consider in use is a caller bug, not a recoverable condition.
    pub fn close(&self, ls: LState) {
        self.close_with_reason(ls, CleanupReason::Discarded);
    }

    pub(crate) fn close_with_reason(&self, ls: LState, reason: CleanupReason) {
        assert!(
            ls.is_serving(),
            "closing Lua state {} that is not checked out",
            ls.id()
        );
        let mut pool = self.inner.pool.lock();
        self.retire_locked(&mut pool, ls, reason);
    }

    /// Close a state and give up its slot. A serving state also releases
    /// its checkout.
    fn retire_locked(&self, pool: &mut PoolState, mut ls: LState, reason: CleanupReason) {
        if ls.is_serving() {
            self.release_slot(pool);
        }
        debug_assert!(pool.length > 0, "retiring Lua state from an empty pool");
        pool.length -= 1;

        let state_id = ls.id();
        ls.close();
        debug!(%state_id, ?reason, length = pool.length, "closed Lua state");
        self.inner
            .events
            .emit(PoolEvent::CleanedUp { state_id, reason });
    }

    /// Count one checkout as finished, waking `shutdown` on the last one.
    fn release_slot(&self, pool: &mut PoolState) {
        debug_assert!(pool.serving_num > 0, "releasing a checkout nobody holds");
        pool.serving_num -= 1;
        if pool.serving_num == 0 {
            self.inner.drained.notify_all();
        }
    }

    /// Stop handing out states, wait for every checked-out state to come
    /// back, then close the idle ones.
    ///
    /// Blocks the calling thread while states are outstanding. Leaves the
    /// pool `Exiting`; [`restart`](Self::restart) brings it back. Calling it
    /// on an already drained pool does nothing.
    pub fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        self.drain();
    }

    /// `ready_exit` + `exit`. Called with the lifecycle lock held.
    fn drain(&self) {
        self.ready_exit();
        self.exit();
    }

    fn ready_exit(&self) {
        let mut pool = self.inner.pool.lock();
        self.set_status(&mut pool, Status::Exiting);
    }

    fn exit(&self) {
        let mut pool = self.inner.pool.lock();
        while pool.serving_num > 0 {
            debug!(serving = pool.serving_num, "waiting for checked-out Lua states");
            self.inner.drained.wait(&mut pool);
        }

        let idle = std::mem::take(&mut pool.idle);
        let closed = idle.len();
        for mut ls in idle {
            let state_id = ls.id();
            ls.close();
            self.inner.events.emit(PoolEvent::CleanedUp {
                state_id,
                reason: CleanupReason::Shutdown,
            });
        }
        debug_assert_eq!(pool.length, closed, "drained pool still counts states");
        pool.length = 0;

        info!(closed, status = %pool.status, "Lua state pool drained");
    }

    /// Shut the pool down and seed it again under `ctx`.
    ///
    /// # Errors
    /// [`Error::Dead`] after [`terminate`](Self::terminate). [`Error::Cancelled`]
    /// if `ctx` is already cancelled; the pool is left drained and `Exiting`.
    /// Otherwise any seeding error.
    pub fn restart(&self, ctx: &Context) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if !self.status().can_restart() {
            return Err(Error::Dead);
        }
        info!(request_id = %ctx.request_id, "restarting Lua state pool");
        self.drain();
        self.start(ctx)
    }

    /// Shut down for good: drain like [`shutdown`](Self::shutdown), then move
    /// to `Dead`. A dead pool refuses `get`, `put` and `restart`.
    pub fn terminate(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        self.drain();
        let mut pool = self.inner.pool.lock();
        self.set_status(&mut pool, Status::Dead);
    }

    /// [`shutdown`](Self::shutdown) on tokio's blocking pool.
    #[cfg(feature = "rt")]
    pub async fn shutdown_async(&self) {
        let this = self.clone();
        Self::join_blocking(tokio::task::spawn_blocking(move || this.shutdown())).await;
    }

    /// [`terminate`](Self::terminate) on tokio's blocking pool.
    #[cfg(feature = "rt")]
    pub async fn terminate_async(&self) {
        let this = self.clone();
        Self::join_blocking(tokio::task::spawn_blocking(move || this.terminate())).await;
    }

    #[cfg(feature = "rt")]
    async fn join_blocking(handle: tokio::task::JoinHandle<()>) {
        if let Err(e) = handle.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }

    fn set_status(&self, pool: &mut PoolState, to: Status) {
        let from = pool.status;
        if from == to || !from.can_transition_to(to) {
            return;
        }
        pool.status = to;
        info!(%from, %to, "Lua state pool status changed");
        self.inner.events.emit(PoolEvent::StatusChanged { from, to });
    }

    /// Replace the interpreter options used for states built from now on.
    pub fn set_state_options(&self, options: StateOptions) {
        self.inner.config.write().set_state_options(options);
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn request_terminate_timeout(&self) -> u64 {
        self.inner.config.read().request_terminate_timeout()
    }

    /// The pool configuration.
    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.inner.pool.lock().status
    }

    /// States allocated and not yet closed.
    pub fn len(&self) -> usize {
        self.inner.pool.lock().length
    }

    /// Whether no states are allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity (`0` = unbounded).
    pub fn cap(&self) -> usize {
        self.inner.config.read().max_num()
    }

    /// States currently checked out.
    pub fn serving_num(&self) -> usize {
        self.inner.pool.lock().serving_num
    }

    /// States waiting in the idle list.
    pub fn idle_num(&self) -> usize {
        self.inner.pool.lock().idle.len()
    }

    /// Checkouts since the manager was created.
    pub fn total_requested_num(&self) -> u64 {
        self.inner.pool.lock().total_requested_num
    }

    /// Snapshot of all counters, taken under one lock.
    pub fn stats(&self) -> PoolStats {
        let max_num = self.cap();
        let pool = self.inner.pool.lock();
        PoolStats {
            status: pool.status,
            length: pool.length,
            idle: pool.idle.len(),
            serving: pool.serving_num,
            total_requested: pool.total_requested_num,
            max_num,
        }
    }
}
