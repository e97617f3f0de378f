//! Pool status state machine

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operational status of a [`Manager`](crate::Manager).
///
/// Within one lifecycle the status only moves forward:
/// `Ready → Running → Exiting → Dead`. A restart begins a new lifecycle,
/// which is the only way back from `Exiting` to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    /// Constructed, not yet seeded
    #[default]
    Ready,
    /// Accepting checkouts and returns
    Running,
    /// Draining: checkouts are refused, outstanding states are awaited
    Exiting,
    /// Terminated for good; cannot be restarted
    Dead,
}

impl Status {
    /// Whether `get` may hand out states in this status
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !matches!(self, Self::Exiting | Self::Dead)
    }

    /// Whether the status is terminal
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Whether `restart` may begin a new lifecycle from this status
    #[must_use]
    pub fn can_restart(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the pool can move to `target`
    #[must_use]
    pub fn can_transition_to(&self, target: Status) -> bool {
        use Status::{Dead, Exiting, Ready, Running};

        match (self, target) {
            (Ready, Running) => true,
            // seeding failed before the pool ever ran
            (Ready, Exiting) => true,
            (Running, Exiting) => true,
            (Exiting, Dead) => true,
            // restart
            (Exiting, Running) => true,
            // repeated shutdown
            (Exiting, Exiting) => true,
            _ => false,
        }
    }

    /// Statuses reachable from this one
    #[must_use]
    pub fn next_states(&self) -> &'static [Status] {
        match self {
            Self::Ready => &[Self::Running, Self::Exiting],
            Self::Running => &[Self::Exiting],
            Self::Exiting => &[Self::Running, Self::Exiting, Self::Dead],
            Self::Dead => &[],
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Dead => "dead",
        };
        write!(f, "{name}")
    }
}
