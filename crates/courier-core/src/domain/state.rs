//! Coordinator lifecycle state.

use serde::Serialize;
use std::fmt;

/// Phase of the coordinator loop.
///
/// Transitions: Idle -> Refilling -> Dispatching -> Draining -> Idle, with
/// Refilling skipped when no new work is expected. Stopped is terminal and
/// entered on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Refilling,
    Dispatching,
    Draining,
    Stopped,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Refilling => "refilling",
            CoordinatorState::Dispatching => "dispatching",
            CoordinatorState::Draining => "draining",
            CoordinatorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
