//! Pool configuration
//!
//! Raw policy values arrive as signed integers and a duration string, either
//! through [`Config::new`] or deserialized as a [`RawConfig`]. The validators
//! below turn them into a [`Config`] whose invariants the manager relies on:
//! `start_num` always lies in `[1, max_num]` when a capacity is set, and the
//! idle timeout is kept both as canonical `"<n><unit>"` text and as seconds.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default capacity (`0` = unbounded).
pub const DEFAULT_MAX_NUM: usize = 0;
/// Default number of states seeded on start when no capacity is set.
pub const DEFAULT_START_NUM: usize = 1;
/// Default per-state request budget (`0` = unlimited).
pub const DEFAULT_MAX_REQUEST: u64 = 0;
/// Default idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: &str = "1h";
/// Replacement for a negative idle-timeout number.
pub const DEFAULT_IDLE_TIMEOUT_NUM: i64 = 1;
/// Default per-request execution timeout in seconds.
pub const DEFAULT_REQUEST_TERMINATE_TIMEOUT: u64 = 120;

// ---------------------------------------------------------------------------
// StateOptions
// ---------------------------------------------------------------------------

/// Standard library set opened in every new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibSet {
    /// Every memory-safe standard library.
    #[default]
    Safe,
    /// `string`, `table` and `math` only.
    Minimal,
}

impl LibSet {
    /// The mlua library flags for this set.
    #[must_use]
    pub fn std_lib(self) -> mlua::StdLib {
        match self {
            Self::Safe => mlua::StdLib::ALL_SAFE,
            Self::Minimal => mlua::StdLib::STRING | mlua::StdLib::TABLE | mlua::StdLib::MATH,
        }
    }
}

/// Interpreter options applied when a state is built.
///
/// Swapping them on a running manager affects only states allocated
/// afterwards; states already in the pool keep the options they were built with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateOptions {
    /// Standard libraries to open.
    pub libs: LibSet,
    /// Memory limit in bytes (`0` = unlimited).
    pub memory_limit: usize,
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Normalize the capacity: negative means unbounded.
#[must_use]
pub fn max_num(n: i64) -> usize {
    if n < 0 { DEFAULT_MAX_NUM } else { n as usize }
}

/// Normalize the seed count against an already normalized capacity.
///
/// Without a capacity a non-positive value becomes `1`. With one, anything
/// outside `[1, max_num]` becomes `max_num / 2 + 1`.
#[must_use]
pub fn start_num(max_num: usize, start_num: i64) -> usize {
    if max_num == 0 {
        if start_num <= 0 {
            DEFAULT_START_NUM
        } else {
            start_num as usize
        }
    } else if start_num <= 0 || start_num as u64 > max_num as u64 {
        max_num / 2 + 1
    } else {
        start_num as usize
    }
}

/// Normalize the per-state request budget: negative means unlimited.
#[must_use]
pub fn max_request(n: i64) -> u64 {
    if n < 0 { DEFAULT_MAX_REQUEST } else { n as u64 }
}

/// Split an idle timeout such as `"30m"` into its number and unit.
///
/// A negative number is replaced by [`DEFAULT_IDLE_TIMEOUT_NUM`]; the unit
/// is kept.
pub fn idle_timeout(value: &str) -> Result<(i64, char)> {
    let unit = match value.chars().last() {
        Some(c @ ('d' | 'h' | 'm' | 's')) if value.len() >= 2 => c,
        _ => {
            return Err(Error::IdleTimeoutFormat {
                value: value.to_string(),
            });
        }
    };

    let prefix = &value[..value.len() - 1];
    let n: i64 = prefix
        .parse()
        .map_err(|e| Error::configuration(format!("invalid idle timeout number '{prefix}'"), e))?;

    Ok((if n < 0 { DEFAULT_IDLE_TIMEOUT_NUM } else { n }, unit))
}

/// Convert an idle timeout to seconds. `0` disables idle retirement.
#[must_use]
pub fn idle_timeout_seconds(n: i64, unit: char) -> u64 {
    if n <= 0 {
        return 0;
    }
    let factor: u64 = match unit {
        'd' => 86_400,
        'h' => 3_600,
        'm' => 60,
        's' => 1,
        // unreachable after `idle_timeout`; an unknown unit means no limit
        _ => return 0,
    };
    (n as u64).saturating_mul(factor)
}

/// Normalize the per-request execution timeout in seconds.
#[must_use]
pub fn request_terminate_timeout(t: i64) -> u64 {
    if t < 0 {
        DEFAULT_REQUEST_TERMINATE_TIMEOUT
    } else {
        t as u64
    }
}

// ---------------------------------------------------------------------------
// RawConfig
// ---------------------------------------------------------------------------

/// Unvalidated configuration as it appears in a config file.
///
/// Missing fields take the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Capacity (`<= 0` = unbounded).
    pub max_num: i64,
    /// States created eagerly on start.
    pub start_num: i64,
    /// Per-state request budget (`<= 0` = unlimited).
    pub max_request: i64,
    /// Per-request execution timeout in seconds.
    pub request_terminate_timeout: i64,
    /// Idle timeout, `<n><d|h|m|s>`.
    pub idle_timeout: String,
    /// Interpreter options.
    pub state_options: StateOptions,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            max_num: DEFAULT_MAX_NUM as i64,
            start_num: DEFAULT_START_NUM as i64,
            max_request: DEFAULT_MAX_REQUEST as i64,
            request_terminate_timeout: DEFAULT_REQUEST_TERMINATE_TIMEOUT as i64,
            idle_timeout: DEFAULT_IDLE_TIMEOUT.to_string(),
            state_options: StateOptions::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Validated pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    max_num: usize,
    start_num: usize,
    max_request: u64,
    idle_timeout: String,
    idle_timeout_secs: u64,
    request_terminate_timeout: u64,
    state_options: StateOptions,
}

impl Config {
    /// Build a configuration from raw values, normalizing each one.
    ///
    /// # Errors
    /// Fails if `idle_timeout` is not `<n><d|h|m|s>`.
    pub fn new(
        max_num: i64,
        start_num: i64,
        max_request: i64,
        request_terminate_timeout: i64,
        idle_timeout: &str,
    ) -> Result<Self> {
        let max = self::max_num(max_num);
        let (n, unit) = self::idle_timeout(idle_timeout)?;

        Ok(Self {
            max_num: max,
            start_num: self::start_num(max, start_num),
            max_request: self::max_request(max_request),
            idle_timeout: format!("{n}{unit}"),
            idle_timeout_secs: idle_timeout_seconds(n, unit),
            request_terminate_timeout: self::request_terminate_timeout(request_terminate_timeout),
            state_options: StateOptions::default(),
        })
    }

    /// Parse and validate a JSON document shaped like [`RawConfig`].
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|e| Error::configuration("invalid JSON pool config", e))?;
        Self::try_from(raw)
    }

    /// Replace the interpreter options.
    pub fn set_state_options(&mut self, options: StateOptions) {
        self.state_options = options;
    }

    /// Builder-style variant of [`set_state_options`](Self::set_state_options).
    pub fn with_state_options(mut self, options: StateOptions) -> Self {
        self.state_options = options;
        self
    }

    /// Capacity (`0` = unbounded).
    pub fn max_num(&self) -> usize {
        self.max_num
    }

    /// States seeded on start.
    pub fn start_num(&self) -> usize {
        self.start_num
    }

    /// Per-state request budget (`0` = unlimited).
    pub fn max_request(&self) -> u64 {
        self.max_request
    }

    /// Canonical idle timeout text, e.g. `"1h"`.
    pub fn idle_timeout(&self) -> &str {
        &self.idle_timeout
    }

    /// Idle timeout in seconds (`0` = unlimited).
    pub fn idle_timeout_secs(&self) -> u64 {
        self.idle_timeout_secs
    }

    /// Per-request execution timeout in seconds (`0` = no deadline).
    pub fn request_terminate_timeout(&self) -> u64 {
        self.request_terminate_timeout
    }

    /// Interpreter options for newly built states.
    pub fn state_options(&self) -> &StateOptions {
        &self.state_options
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_num: DEFAULT_MAX_NUM,
            start_num: DEFAULT_START_NUM,
            max_request: DEFAULT_MAX_REQUEST,
            idle_timeout: DEFAULT_IDLE_TIMEOUT.to_string(),
            idle_timeout_secs: 3_600,
            request_terminate_timeout: DEFAULT_REQUEST_TERMINATE_TIMEOUT,
            state_options: StateOptions::default(),
        }
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        Ok(Self::new(
            raw.max_num,
            raw.start_num,
            raw.max_request,
            raw.request_terminate_timeout,
            &raw.idle_timeout,
        )?
        .with_state_options(raw.state_options))
    }
}
