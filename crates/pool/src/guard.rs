//! RAII guard for checked-out states

use crate::events::CleanupReason;
use crate::manager::Manager;
use crate::state::LState;

/// RAII guard that wraps a checked-out [`LState`].
///
/// When the guard is dropped the state is returned with
/// [`Manager::put`]. Use [`discard`](Self::discard) to close it instead, or
/// [`into_inner`](Self::into_inner) to take over returning it yourself.
///
/// A guard dropped while its thread is panicking closes the state: whatever
/// was running on it stopped halfway.
pub struct StateGuard {
    manager: Manager,
    state: Option<LState>,
}

impl StateGuard {
    pub(crate) fn new(manager: Manager, state: LState) -> Self {
        Self {
            manager,
            state: Some(state),
        }
    }

    /// Close the state instead of returning it to the pool.
    pub fn discard(self) {
        self.discard_with(CleanupReason::Discarded);
    }

    pub(crate) fn discard_with(mut self, reason: CleanupReason) {
        if let Some(state) = self.state.take() {
            self.manager.close_with_reason(state, reason);
        }
    }

    /// Take the state out of the guard, preventing the return on drop.
    #[must_use]
    pub fn into_inner(mut self) -> LState {
        self.state.take().expect("guard used after into_inner")
    }
}

impl std::ops::Deref for StateGuard {
    type Target = LState;

    fn deref(&self) -> &LState {
        self.state.as_ref().expect("guard used after into_inner")
    }
}

impl std::ops::DerefMut for StateGuard {
    fn deref_mut(&mut self) -> &mut LState {
        self.state.as_mut().expect("guard used after into_inner")
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        if std::thread::panicking() {
            tracing::warn!(state_id = %state.id(), "closing Lua state after panic");
            self.manager.close_with_reason(state, CleanupReason::ScriptFailure);
        } else if let Err(e) = self.manager.put(state) {
            tracing::debug!(error = %e, "Lua state not returned to pool");
        }
    }
}

impl std::fmt::Debug for StateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateGuard")
            .field("state", &self.state)
            .finish()
    }
}
