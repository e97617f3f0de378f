//! # lspool
//!
//! A bounded pool of Lua interpreter states. The [`Manager`] hands states out
//! for request execution, recycles them while they are healthy, retires them
//! once they exhaust their request budget or outlive their idle timeout, and
//! drains outstanding checkouts before shutting down.
//!
//! ```no_run
//! use lspool::{Config, Context, Manager};
//!
//! # fn main() -> lspool::Result<()> {
//! let ctx = Context::background();
//! let pool = Manager::new(&ctx, Config::new(8, 2, 1000, 30, "10m")?, None)?;
//!
//! let answer: i64 = pool.eval(&Context::new("req-1"), "return 40 + 2")?;
//! assert_eq!(answer, 42);
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
mod exec;
pub mod guard;
pub mod manager;
pub mod state;
pub mod status;

pub use config::{Config, LibSet, RawConfig, StateOptions};
pub use context::Context;
pub use error::{Error, Result};
pub use events::{CleanupReason, EventBus, PoolEvent};
pub use guard::StateGuard;
pub use manager::{Manager, PoolStats};
pub use state::{InitHook, LState};
pub use status::Status;

pub use mlua;
