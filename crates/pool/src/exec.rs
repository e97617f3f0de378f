//! Execution helpers: run chunks on a pooled state.
//!
//! Every helper checks a state out, runs the work under a watchdog and then
//! either returns the state (success) or closes it (failure). A chunk that
//! raised an error may have left globals half-updated, so the state is not
//! trusted with another request.
//!
//! The watchdog is an instruction-count hook. It aborts the chunk when the
//! request context or the state's own token is cancelled, or when the
//! configured request terminate timeout elapses.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use mlua::{FromLuaMulti, Function, HookTriggers, Lua, VmState};
use tracing::warn;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::events::CleanupReason;
use crate::manager::Manager;
use crate::state::LState;

/// Instructions between two watchdog checks.
const WATCHDOG_INSTRUCTIONS: u32 = 1_000;

const TRIP_NONE: u8 = 0;
const TRIP_CANCELLED: u8 = 1;
const TRIP_TIMEOUT: u8 = 2;

impl Manager {
    /// Run `f` against a pooled interpreter.
    ///
    /// The building block for the other helpers. On success the state goes
    /// back to the pool; if `f` fails or panics, or the watchdog aborts it,
    /// the state is closed.
    pub fn with_state<R>(&self, ctx: &Context, f: impl FnOnce(&Lua) -> mlua::Result<R>) -> Result<R> {
        // The guard closes the state if `f` panics.
        let guard = self.acquire(ctx)?;

        match self.run_watched(ctx, &guard, f) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    state_id = %guard.id(),
                    request_id = %ctx.request_id,
                    metadata = ?ctx.metadata,
                    error = %e,
                    "discarding Lua state after failed run"
                );
                guard.discard_with(CleanupReason::ScriptFailure);
                Err(e)
            }
        }
    }

    /// Compile a chunk read from `reader` and hand the compiled function to `f`.
    pub fn load<R>(
        &self,
        ctx: &Context,
        mut reader: impl Read,
        name: &str,
        f: impl FnOnce(&Lua, Function) -> mlua::Result<R>,
    ) -> Result<R> {
        let mut source = Vec::new();
        reader.read_to_end(&mut source).map_err(|source| Error::Io {
            name: name.to_string(),
            source,
        })?;
        self.compile_and(ctx, &source, format!("={name}"), f)
    }

    /// Compile a file and hand the compiled function to `f`.
    pub fn load_file<R>(
        &self,
        ctx: &Context,
        path: impl AsRef<Path>,
        f: impl FnOnce(&Lua, Function) -> mlua::Result<R>,
    ) -> Result<R> {
        let (source, name) = read_file(path.as_ref())?;
        self.compile_and(ctx, &source, name, f)
    }

    /// Compile `source` and hand the compiled function to `f`.
    pub fn load_string<R>(
        &self,
        ctx: &Context,
        source: &str,
        f: impl FnOnce(&Lua, Function) -> mlua::Result<R>,
    ) -> Result<R> {
        self.compile_and(ctx, source.as_bytes(), "=load_string".to_string(), f)
    }

    /// Run a file.
    pub fn do_file(&self, ctx: &Context, path: impl AsRef<Path>) -> Result<()> {
        let (source, name) = read_file(path.as_ref())?;
        self.with_state(ctx, |lua| lua.load(&source[..]).set_name(name).exec())
    }

    /// Run `source`.
    pub fn do_string(&self, ctx: &Context, source: &str) -> Result<()> {
        self.with_state(ctx, |lua| lua.load(source).set_name("=do_string").exec())
    }

    /// Run `source` and convert what it returns.
    pub fn eval<R: FromLuaMulti>(&self, ctx: &Context, source: &str) -> Result<R> {
        self.with_state(ctx, |lua| lua.load(source).set_name("=eval").eval())
    }

    fn compile_and<R>(
        &self,
        ctx: &Context,
        source: &[u8],
        name: String,
        f: impl FnOnce(&Lua, Function) -> mlua::Result<R>,
    ) -> Result<R> {
        self.with_state(ctx, |lua| {
            let function = lua.load(source).set_name(name).into_function()?;
            f(lua, function)
        })
    }

    fn run_watched<R>(
        &self,
        ctx: &Context,
        ls: &LState,
        f: impl FnOnce(&Lua) -> mlua::Result<R>,
    ) -> Result<R> {
        let lua = ls.lua().ok_or(Error::Closed)?;

        let timeout_secs = self.request_terminate_timeout();
        let deadline = (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
        let tripped = Arc::new(AtomicU8::new(TRIP_NONE));

        {
            let request = ctx.cancellation.clone();
            let state = ls.cancellation().clone();
            let tripped = Arc::clone(&tripped);
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(WATCHDOG_INSTRUCTIONS),
                move |_lua, _debug| {
                    if request.is_cancelled() || state.is_cancelled() {
                        tripped.store(TRIP_CANCELLED, Ordering::Release);
                        return Err(mlua::Error::RuntimeError("execution cancelled".to_string()));
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        tripped.store(TRIP_TIMEOUT, Ordering::Release);
                        return Err(mlua::Error::RuntimeError("execution timed out".to_string()));
                    }
                    Ok(VmState::Continue)
                },
            );
        }

        let outcome = f(lua);
        lua.remove_hook();

        outcome.map_err(|e| match tripped.load(Ordering::Acquire) {
            TRIP_CANCELLED => Error::Cancelled,
            TRIP_TIMEOUT => Error::Timeout { timeout_secs },
            _ => Error::Script(e),
        })
    }
}

fn read_file(path: &Path) -> Result<(Vec<u8>, String)> {
    let source = std::fs::read(path).map_err(|source| Error::Io {
        name: path.display().to_string(),
        source,
    })?;
    Ok((source, format!("@{}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn manager() -> Manager {
        Manager::new(&Context::background(), Config::default(), None).unwrap()
    }

    #[test]
    fn eval_returns_value_and_recycles() {
        let pm = manager();
        let n: i64 = pm.eval(&Context::background(), "return 6 * 7").unwrap();
        assert_eq!(n, 42);
        assert_eq!(pm.len(), 1);
        assert_eq!(pm.idle_num(), 1);
    }

    #[test]
    fn hook_is_removed_after_run() {
        let pm = manager();
        let ctx = Context::new("req-1");
        pm.do_string(&ctx, "x = 1").unwrap();
        ctx.cancellation.cancel();

        // A leftover watchdog would see the cancelled request and abort.
        let ls = pm.get(&Context::background()).unwrap();
        let n: i64 = ls
            .lua()
            .unwrap()
            .load("local s = 0 for i = 1, 10000 do s = s + i end return s")
            .eval()
            .unwrap();
        assert_eq!(n, 50_005_000);
        pm.put(ls).unwrap();
    }

    #[test]
    fn load_reader_failure_does_not_touch_pool() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk on fire"))
            }
        }

        let pm = manager();
        let err = pm
            .load(&Context::background(), Broken, "broken", |_, f| f.call::<()>(()))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(pm.total_requested_num(), 0);
        assert_eq!(pm.len(), 1);
    }
}
