//! Pooled Lua state and its retirement policy.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mlua::{Lua, LuaOptions};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StateOptions;
use crate::context::Context;
use crate::error::{Error, Result};

/// Hook run once on every freshly built state, e.g. to preload modules or
/// register host functions. A failing hook aborts the allocation.
pub type InitHook = Arc<dyn Fn(&Lua) -> mlua::Result<()> + Send + Sync>;

/// One interpreter instance plus the bookkeeping the pool needs to decide
/// when it must be retired.
///
/// A state is owned by exactly one party at a time: the pool's idle list, or
/// the caller between [`Manager::get`](crate::Manager::get) and
/// [`Manager::put`](crate::Manager::put) / [`Manager::close`](crate::Manager::close).
pub struct LState {
    id: Uuid,
    lua: Option<Lua>,
    requested_num: u64,
    created_at: DateTime<Utc>,
    max_request: u64,
    idle_timeout_secs: u64,
    serving: bool,
    serving_since: Option<Instant>,
    closed: bool,
    cancellation: CancellationToken,
}

impl LState {
    /// Build a new interpreter and run `init_hook` on it.
    ///
    /// The state's cancellation token is derived from `ctx`, so cancelling
    /// the creating context also cancels anything running on the state.
    ///
    /// # Errors
    /// Returns [`Error::Initialization`] if the interpreter cannot be built,
    /// the memory limit cannot be applied, or the hook fails. The interpreter
    /// is released before the error is returned.
    pub fn create(
        ctx: &Context,
        max_request: u64,
        idle_timeout_secs: u64,
        options: &StateOptions,
        init_hook: Option<&InitHook>,
    ) -> Result<Self> {
        let lua = Lua::new_with(options.libs.std_lib(), LuaOptions::default())
            .map_err(|e| Error::initialization("failed to build interpreter", e))?;

        if options.memory_limit > 0 {
            lua.set_memory_limit(options.memory_limit)
                .map_err(|e| Error::initialization("failed to apply memory limit", e))?;
        }

        if let Some(hook) = init_hook {
            if let Err(e) = hook(&lua) {
                drop(lua);
                return Err(Error::initialization("init hook failed", e));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            lua: Some(lua),
            requested_num: 0,
            created_at: Utc::now(),
            max_request,
            idle_timeout_secs,
            serving: false,
            serving_since: None,
            closed: false,
            cancellation: ctx.cancellation.child_token(),
        })
    }

    /// Count one more request served by this state.
    pub fn inc_request_num(&mut self) {
        self.requested_num += 1;
    }

    /// Whether the state has to be retired instead of recycled.
    ///
    /// A request budget, when configured, is the only criterion; the idle
    /// timeout is consulted only for states without one.
    #[must_use]
    pub fn must_terminate(&self) -> bool {
        if self.max_request > 0 {
            return self.requested_num >= self.max_request;
        }
        self.idle_timeout_secs > 0
            && Utc::now().timestamp() - self.created_at.timestamp() > self.idle_timeout_secs as i64
    }

    /// Mark the state as checked out (or not).
    pub fn set_serving(&mut self, serving: bool) {
        self.serving = serving;
        self.serving_since = serving.then(Instant::now);
    }

    /// Cancel anything running on the state and release the interpreter.
    ///
    /// A second call finds nothing left to release.
    pub fn close(&mut self) {
        self.closed = true;
        self.serving = false;
        self.serving_since = None;
        self.cancellation.cancel();
        drop(self.lua.take());
    }

    /// Unique identifier, used in logs and events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The interpreter, or `None` once closed.
    pub fn lua(&self) -> Option<&Lua> {
        self.lua.as_ref()
    }

    /// Requests served so far.
    pub fn requested_num(&self) -> u64 {
        self.requested_num
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the state is checked out.
    pub fn is_serving(&self) -> bool {
        self.serving
    }

    /// Whether the state has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// How long the state has been checked out, if it is.
    pub fn serving_for(&self) -> Option<Duration> {
        self.serving_since.map(|since| since.elapsed())
    }

    /// Token cancelled when the state is closed or its creating context is
    /// cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, secs: i64) {
        self.created_at -= chrono::Duration::seconds(secs);
    }
}

impl Drop for LState {
    fn drop(&mut self) {
        if self.serving && !self.closed {
            tracing::warn!(
                state_id = %self.id,
                "checked-out Lua state dropped without put/close; its pool slot stays occupied"
            );
        }
        self.cancellation.cancel();
    }
}

impl fmt::Debug for LState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LState")
            .field("id", &self.id)
            .field("requested_num", &self.requested_num)
            .field("created_at", &self.created_at)
            .field("max_request", &self.max_request)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("serving", &self.serving)
            .field("closed", &self.closed)
            .finish()
    }
}
